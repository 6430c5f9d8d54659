// Tool worker
//
// Claims pending tool executions and either runs the tool locally or, for
// agent-as-tool, creates a child session and run and leaves the execution
// running until the child finishes (the child-run trigger completes it).
// Terminal transitions performed here drive the storage-side fan-in that
// advances the parent run.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use agentpg_core::{
    extract_agent_prompt, EngineConfig, NewRun, NewSession, ToolExecution,
};
use agentpg_storage::{NotifyChannel, Store, StoreError};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::tools::{ToolOutcome, ToolRegistry};

pub struct ToolWorker {
    store: Arc<dyn Store>,
    registry: ToolRegistry,
    instance_id: Uuid,
    config: EngineConfig,
    retry_policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl ToolWorker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ToolRegistry,
        instance_id: Uuid,
        config: EngineConfig,
        shutdown_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tools));
        Self {
            store,
            registry,
            instance_id,
            config,
            retry_policy: RetryPolicy::exponential(),
            shutdown_rx,
            cancel,
            semaphore,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub async fn run(mut self) {
        let mut events = self.store.subscribe(NotifyChannel::ToolPending);
        let mut ticker = tokio::time::interval(self.config.tool_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                event = events.recv() => {
                    if event.is_err() {
                        continue;
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                continue;
            }
            let batch = self.config.claim_batch_size.min(available);

            let claimed = match self
                .store
                .claim_tool_executions(self.instance_id, batch)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("claiming tool executions failed: {}", e);
                    continue;
                }
            };

            for execution in claimed {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    break;
                };

                let handler = ToolHandler {
                    store: Arc::clone(&self.store),
                    registry: self.registry.clone(),
                    instance_id: self.instance_id,
                    config: self.config.clone(),
                    retry_policy: self.retry_policy.clone(),
                    cancel: self.cancel.child_token(),
                };

                tokio::spawn(async move {
                    let execution_id = execution.id;
                    let store = Arc::clone(&handler.store);
                    let retry_policy = handler.retry_policy.clone();
                    let attempt = execution.attempt_count;

                    let outcome = std::panic::AssertUnwindSafe(handler.handle(execution))
                        .catch_unwind()
                        .await;
                    if outcome.is_err() {
                        error!(%execution_id, "tool handler panicked");
                        let retry_at =
                            Utc::now() + retry_delay(&retry_policy, attempt + 1);
                        if let Err(e) = store
                            .fail_tool_execution(execution_id, "tool handler panicked", retry_at)
                            .await
                        {
                            if !benign(&e) {
                                error!(%execution_id, "failing panicked execution failed: {}", e);
                            }
                        }
                    }
                    drop(permit);
                });
            }
        }
        debug!(instance_id = %self.instance_id, "tool worker stopped");
    }
}

fn retry_delay(policy: &RetryPolicy, next_attempt: i32) -> chrono::Duration {
    chrono::Duration::from_std(policy.delay_for_attempt(next_attempt)).unwrap_or_default()
}

/// Transitions lost to a concurrent one (cancellation skipping the row, a
/// rescue releasing it) are expected, not errors.
fn benign(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::InvalidTransition { .. } | StoreError::Precondition(_)
    )
}

struct ToolHandler {
    store: Arc<dyn Store>,
    registry: ToolRegistry,
    instance_id: Uuid,
    config: EngineConfig,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ToolHandler {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, tool = %execution.tool_name))]
    async fn handle(&self, execution: ToolExecution) {
        if execution.is_agent_tool {
            self.handle_agent_tool(execution).await;
        } else {
            self.handle_regular_tool(execution).await;
        }
    }

    async fn handle_regular_tool(&self, execution: ToolExecution) {
        let Some(tool) = self.registry.get(&execution.tool_name) else {
            // Another instance carrying the tool can claim the retry
            self.fail(
                &execution,
                &format!("tool '{}' not registered on this instance", execution.tool_name),
            )
            .await;
            return;
        };
        let tool = Arc::clone(tool);

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(
                self.config.tool_timeout,
                tool.execute(execution.tool_input.clone()),
            ) => outcome,
            _ = self.cancel.cancelled() => {
                // Leave the row claimed; rescue or cancellation settles it
                debug!(execution_id = %execution.id, "tool handler cancelled");
                return;
            }
        };

        match outcome {
            Ok(ToolOutcome::Success(output)) => {
                match self.store.complete_tool_execution(execution.id, &output).await {
                    Ok(_) => {}
                    Err(e) if benign(&e) => {
                        debug!(execution_id = %execution.id, "completion lost to concurrent transition");
                    }
                    Err(e) => error!(execution_id = %execution.id, "completing execution failed: {}", e),
                }
            }
            Ok(ToolOutcome::Error(message)) => {
                self.fail(&execution, &message).await;
            }
            Ok(ToolOutcome::Snooze(delay)) => {
                let until = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                match self.store.snooze_tool_execution(execution.id, until).await {
                    Ok(_) => debug!(execution_id = %execution.id, "tool snoozed"),
                    Err(e) if benign(&e) => {}
                    Err(e) => error!(execution_id = %execution.id, "snoozing execution failed: {}", e),
                }
            }
            Err(_) => {
                self.fail(
                    &execution,
                    &format!(
                        "tool '{}' timed out after {:?}",
                        execution.tool_name, self.config.tool_timeout
                    ),
                )
                .await;
            }
        }
    }

    /// Agent-as-tool: create the child session and run; the execution stays
    /// running until trg_child_run_complete finishes it.
    async fn handle_agent_tool(&self, execution: ToolExecution) {
        let Some(agent_name) = execution.agent_name.clone() else {
            self.fail(&execution, "agent tool execution without agent_name").await;
            return;
        };

        let parent_run = match self.store.get_run(execution.run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(execution_id = %execution.id, "loading parent run failed: {}", e);
                return;
            }
        };

        if parent_run.depth + 1 > self.config.max_depth {
            self.fail(
                &execution,
                &format!(
                    "agent nesting depth {} exceeds the cap of {}",
                    parent_run.depth + 1,
                    self.config.max_depth
                ),
            )
            .await;
            return;
        }

        let parent_session = match self.store.get_session(parent_run.session_id).await {
            Ok(session) => session,
            Err(e) => {
                error!(execution_id = %execution.id, "loading parent session failed: {}", e);
                return;
            }
        };

        // Idempotence: a retried claim after a crash may find the child
        // already created
        if execution.child_run_id.is_some() {
            debug!(execution_id = %execution.id, "child run already exists");
            return;
        }

        let prompt = extract_agent_prompt(&execution.tool_input);

        let child_session = match self
            .store
            .create_session(
                NewSession::new(
                    parent_session.tenant.clone(),
                    format!("{}/{}", parent_session.identifier, execution.id),
                )
                .with_parent(&parent_session),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(execution_id = %execution.id, "creating child session failed: {}", e);
                self.fail(&execution, &format!("creating child session failed: {}", e))
                    .await;
                return;
            }
        };

        let child_run = match self
            .store
            .create_run(
                NewRun {
                    created_by_instance_id: Some(self.instance_id),
                    run_mode: parent_run.run_mode,
                    ..NewRun::new(child_session.id, agent_name, prompt)
                }
                .as_child_of(&parent_run, execution.id),
            )
            .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(execution_id = %execution.id, "creating child run failed: {}", e);
                self.fail(&execution, &format!("creating child run failed: {}", e))
                    .await;
                return;
            }
        };

        match self
            .store
            .set_tool_execution_child_run(execution.id, child_run.id)
            .await
        {
            Ok(()) => {
                debug!(
                    execution_id = %execution.id,
                    child_run_id = %child_run.id,
                    depth = child_run.depth,
                    "spawned child run"
                );
            }
            Err(e) if benign(&e) => {
                // The execution was skipped underneath us; stop the child
                warn!(execution_id = %execution.id, "parent execution gone, cancelling child");
                let _ = self.store.cancel_run(child_run.id).await;
            }
            Err(e) => {
                error!(execution_id = %execution.id, "linking child run failed: {}", e);
            }
        }
    }

    async fn fail(&self, execution: &ToolExecution, message: &str) {
        let retry_at = Utc::now() + retry_delay(&self.retry_policy, execution.attempt_count + 1);
        match self
            .store
            .fail_tool_execution(execution.id, message, retry_at)
            .await
        {
            Ok(_) => {}
            Err(e) if benign(&e) => {
                debug!(execution_id = %execution.id, "failure lost to concurrent transition");
            }
            Err(e) => error!(execution_id = %execution.id, "failing execution failed: {}", e),
        }
    }
}
