// Cleanup / rescue loop
//
// Runs only while this instance holds the leader lease. Each pass, in
// order: deregister stale instances (which releases their claims), rescue
// stuck runs or orphan-fail those out of rescue budget, unwedge runs stuck
// in pending_tools with nothing left to wait for, and drop expired leader
// rows. Every storage op is its own idempotent transaction, so a brief
// leadership overlap double-executes harmlessly. Callbacks fire after the
// work, never inside a transaction.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentpg_core::{ContentBlock, EngineConfig, ErrorType, Run, RunState, RunUpdates};
use agentpg_storage::{Store, StoreError};

/// Most rows handled per category per pass
const CLEANUP_BATCH: usize = 100;

/// Invoked after a stale instance was deregistered
pub type StaleInstanceCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Invoked after a stuck run was rescued or orphan-failed
pub type StuckRunCallback = Arc<dyn Fn(&Run) + Send + Sync>;

/// Invoked after a cleanup step errored
pub type CleanupErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

#[derive(Default, Clone)]
pub struct CleanupCallbacks {
    pub on_stale_instance: Option<StaleInstanceCallback>,
    pub on_stuck_run: Option<StuckRunCallback>,
    pub on_error: Option<CleanupErrorCallback>,
}

pub struct CleanupService {
    store: Arc<dyn Store>,
    config: EngineConfig,
    leadership_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    callbacks: CleanupCallbacks,
}

impl CleanupService {
    pub fn new(
        store: Arc<dyn Store>,
        config: EngineConfig,
        leadership_rx: watch::Receiver<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            leadership_rx,
            shutdown_rx,
            callbacks: CleanupCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: CleanupCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *self.leadership_rx.borrow() {
                        self.pass().await;
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("cleanup loop stopped");
    }

    /// One full cleanup pass. Public so tests can drive passes directly.
    pub async fn pass(&self) {
        self.sweep_stale_instances().await;
        self.sweep_stuck_runs().await;
        self.sweep_stuck_pending_tools().await;
        self.sweep_expired_leader_rows().await;
    }

    async fn sweep_stale_instances(&self) {
        let stale = match self.store.list_stale_instances(self.config.instance_ttl).await {
            Ok(stale) => stale,
            Err(e) => {
                error!("listing stale instances failed: {}", e);
                self.report(&e);
                return;
            }
        };

        for instance in stale {
            match self.store.deregister_instance(instance.id).await {
                Ok(()) => {
                    info!(
                        instance_id = %instance.id,
                        last_heartbeat = %instance.last_heartbeat_at,
                        "deregistered stale instance"
                    );
                    if let Some(callback) = &self.callbacks.on_stale_instance {
                        callback(instance.id);
                    }
                }
                Err(e) => {
                    error!(instance_id = %instance.id, "deregistering stale instance failed: {}", e);
                    self.report(&e);
                }
            }
        }
    }

    async fn sweep_stuck_runs(&self) {
        // Runs with rescue budget left go back to the queue
        match self
            .store
            .get_stuck_runs(
                self.config.stuck_run_timeout,
                self.config.max_rescue_attempts,
                CLEANUP_BATCH,
            )
            .await
        {
            Ok(stuck) => {
                for run in stuck {
                    match self.store.rescue_run(run.id).await {
                        Ok(rescued) => {
                            warn!(
                                run_id = %run.id,
                                rescue_attempts = rescued.rescue_attempts,
                                "rescued stuck run"
                            );
                            if let Some(callback) = &self.callbacks.on_stuck_run {
                                callback(&rescued);
                            }
                        }
                        Err(e) => {
                            error!(run_id = %run.id, "rescue failed: {}", e);
                            self.report(&e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("listing stuck runs failed: {}", e);
                self.report(&e);
            }
        }

        // Runs out of budget are orphan-failed
        match self
            .store
            .get_rescue_exhausted_runs(
                self.config.stuck_run_timeout,
                self.config.max_rescue_attempts,
                CLEANUP_BATCH,
            )
            .await
        {
            Ok(exhausted) => {
                for run in exhausted {
                    let updates = RunUpdates {
                        error_message: Some(format!(
                            "claimed by dead instance after {} rescue attempts",
                            run.rescue_attempts
                        )),
                        error_type: Some(ErrorType::Orphan),
                        ..Default::default()
                    };
                    match self
                        .store
                        .update_run_state(run.id, RunState::Failed, updates)
                        .await
                    {
                        Ok(failed) => {
                            warn!(run_id = %run.id, "orphan-failed run at rescue budget");
                            if let Some(callback) = &self.callbacks.on_stuck_run {
                                callback(&failed);
                            }
                        }
                        Err(e) => {
                            error!(run_id = %run.id, "orphan-failing run failed: {}", e);
                            self.report(&e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("listing rescue-exhausted runs failed: {}", e);
                self.report(&e);
            }
        }
    }

    /// The missed-notification probe: pending_tools runs with nothing
    /// non-terminal left are continued by re-running the fan-in step.
    async fn sweep_stuck_pending_tools(&self) {
        let stuck = match self.store.get_stuck_pending_tools_runs(CLEANUP_BATCH).await {
            Ok(stuck) => stuck,
            Err(e) => {
                error!("listing stuck pending_tools runs failed: {}", e);
                self.report(&e);
                return;
            }
        };

        for run in stuck {
            let Some(iteration_id) = run.current_iteration_id else {
                // No iteration to aggregate; this run cannot make progress
                let updates = RunUpdates {
                    error_message: Some("pending_tools with no current iteration".into()),
                    error_type: Some(ErrorType::Internal),
                    ..Default::default()
                };
                if let Err(e) = self
                    .store
                    .update_run_state(run.id, RunState::Failed, updates)
                    .await
                {
                    error!(run_id = %run.id, "failing wedged run failed: {}", e);
                    self.report(&e);
                }
                continue;
            };

            let blocks = match self.store.list_iteration_tool_executions(iteration_id).await {
                Ok(executions) => executions
                    .iter()
                    .map(|e| {
                        ContentBlock::tool_result(
                            e.tool_use_id.clone(),
                            e.tool_output
                                .clone()
                                .or_else(|| e.error_message.clone())
                                .unwrap_or_default(),
                            e.is_error,
                        )
                    })
                    .collect(),
                Err(e) => {
                    error!(run_id = %run.id, "listing executions failed: {}", e);
                    self.report(&e);
                    continue;
                }
            };

            match self
                .store
                .complete_tools_and_continue_run(run.session_id, run.id, blocks)
                .await
            {
                Ok(_) => {
                    warn!(run_id = %run.id, "continued run stuck in pending_tools");
                }
                Err(StoreError::Precondition(reason)) => {
                    // A tool finished between the probe and the fix; the
                    // normal fan-in owns it now
                    debug!(run_id = %run.id, "pending_tools probe raced fan-in: {}", reason);
                }
                Err(e) => {
                    error!(run_id = %run.id, "continuing stuck run failed: {}", e);
                    self.report(&e);
                }
            }
        }
    }

    async fn sweep_expired_leader_rows(&self) {
        match self.store.leader_delete_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed expired leader rows"),
            Err(e) => {
                error!("removing expired leader rows failed: {}", e);
                self.report(&e);
            }
        }
    }

    fn report(&self, error: &StoreError) {
        if let Some(callback) = &self.callbacks.on_error {
            callback(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpg_core::{NewInstance, NewRun, NewSession};
    use agentpg_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service(store: &Arc<MemoryStore>, config: EngineConfig) -> CleanupService {
        let (_, leadership_rx) = watch::channel(true);
        let (_, shutdown_rx) = watch::channel(false);
        CleanupService::new(
            Arc::clone(store) as Arc<dyn Store>,
            config,
            leadership_rx,
            shutdown_rx,
        )
    }

    #[tokio::test]
    async fn pass_rescues_stuck_run_and_sweeps_instance() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig::default();

        let dead_instance = Uuid::now_v7();
        store
            .register_instance(NewInstance::new(dead_instance, 10, 50))
            .await
            .unwrap();
        let session = store
            .create_session(NewSession::new("test", "cleanup"))
            .await
            .unwrap();
        let run = store
            .create_run(NewRun::new(session.id, "chat", "hello"))
            .await
            .unwrap();
        let claimed = store.claim_runs(dead_instance, 1, None).await.unwrap();
        assert_eq!(claimed[0].id, run.id);

        let rescued_count = Arc::new(AtomicUsize::new(0));
        let stale_count = Arc::new(AtomicUsize::new(0));
        let rescued_clone = Arc::clone(&rescued_count);
        let stale_clone = Arc::clone(&stale_count);
        let service = service(&store, config).with_callbacks(CleanupCallbacks {
            on_stuck_run: Some(Arc::new(move |_| {
                rescued_clone.fetch_add(1, Ordering::SeqCst);
            })),
            on_stale_instance: Some(Arc::new(move |_| {
                stale_clone.fetch_add(1, Ordering::SeqCst);
            })),
            on_error: None,
        });

        // Nothing stale or stuck yet
        service.pass().await;
        assert_eq!(rescued_count.load(Ordering::SeqCst), 0);
        assert_eq!(stale_count.load(Ordering::SeqCst), 0);

        // Push everything past its deadline. Deregistration releases the
        // claim first, so the run is claimable rather than rescue-counted.
        store.advance_clock(Duration::from_secs(3700));
        service.pass().await;

        assert_eq!(stale_count.load(Ordering::SeqCst), 1);
        assert!(store.list_instances().await.unwrap().is_empty());
        let run = store.get_run(run.id).await.unwrap();
        assert!(run.claimed_by_instance_id.is_none());
        assert_eq!(run.state, RunState::PendingApi);
    }

    #[tokio::test]
    async fn stuck_run_without_stale_instance_is_rescued_then_orphan_failed() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig::default().with_max_rescue_attempts(1);

        // An instance that keeps heartbeating but whose handler is wedged
        let wedged_instance = Uuid::now_v7();
        store
            .register_instance(NewInstance::new(wedged_instance, 10, 50))
            .await
            .unwrap();
        let session = store
            .create_session(NewSession::new("test", "wedged"))
            .await
            .unwrap();
        let run = store
            .create_run(NewRun::new(session.id, "chat", "hello"))
            .await
            .unwrap();
        store.claim_runs(wedged_instance, 1, None).await.unwrap();

        store.advance_clock(Duration::from_secs(3700));
        store.heartbeat_instance(wedged_instance).await.unwrap();
        service(&store, config.clone()).pass().await;

        let rescued = store.get_run(run.id).await.unwrap();
        assert_eq!(rescued.state, RunState::Pending);
        assert_eq!(rescued.rescue_attempts, 1);

        // Wedges again after the rescue budget is spent: orphan-fail
        store.claim_runs(wedged_instance, 1, None).await.unwrap();
        store.advance_clock(Duration::from_secs(3700));
        store.heartbeat_instance(wedged_instance).await.unwrap();
        service(&store, config).pass().await;

        let failed = store.get_run(run.id).await.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert_eq!(failed.error_type, Some(ErrorType::Orphan));
        assert!(failed.finalized_at.is_some());
    }
}
