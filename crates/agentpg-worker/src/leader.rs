// Leader election
//
// One TTL lease row enforces a single leader across the fleet. Non-leaders
// retry every election_period; the leader renews every reelection_delay
// (strictly less than the TTL, enforced by EngineConfig::validate). A failed
// renewal immediately demotes: the successor's insert and our expired check
// can only overlap within the clock-skew window, and everything the leader
// does is idempotent against brief double execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentpg_storage::Store;

pub struct LeaderElector {
    store: Arc<dyn Store>,
    instance_id: Uuid,
    leader_ttl: Duration,
    election_period: Duration,
    reelection_delay: Duration,
    shutdown_rx: watch::Receiver<bool>,
    leadership_tx: watch::Sender<bool>,
}

impl LeaderElector {
    /// Returns the elector and a receiver that tracks whether this instance
    /// currently holds the lease.
    pub fn new(
        store: Arc<dyn Store>,
        instance_id: Uuid,
        leader_ttl: Duration,
        election_period: Duration,
        reelection_delay: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<bool>) {
        let (leadership_tx, leadership_rx) = watch::channel(false);
        (
            Self {
                store,
                instance_id,
                leader_ttl,
                election_period,
                reelection_delay,
                shutdown_rx,
                leadership_tx,
            },
            leadership_rx,
        )
    }

    pub async fn run(mut self) {
        let mut is_leader = false;

        loop {
            let delay = if is_leader {
                self.reelection_delay
            } else {
                self.election_period
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if is_leader {
                match self
                    .store
                    .leader_attempt_reelect(self.instance_id, self.leader_ttl)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(instance_id = %self.instance_id, "lost leadership");
                        is_leader = false;
                        let _ = self.leadership_tx.send(false);
                    }
                    Err(e) => {
                        // Transient storage errors are retried next tick; if
                        // the lease really expired the next reelect says so
                        error!("leader renewal error: {}", e);
                    }
                }
            } else {
                match self
                    .store
                    .leader_attempt_elect(self.instance_id, self.leader_ttl)
                    .await
                {
                    Ok(true) => {
                        info!(instance_id = %self.instance_id, "became leader");
                        is_leader = true;
                        let _ = self.leadership_tx.send(true);
                    }
                    Ok(false) => {
                        debug!(instance_id = %self.instance_id, "leader seat taken");
                    }
                    Err(e) => {
                        error!("leader election error: {}", e);
                    }
                }
            }
        }

        if is_leader {
            if let Err(e) = self.store.leader_resign(self.instance_id).await {
                error!("leader resignation error: {}", e);
            }
            let _ = self.leadership_tx.send(false);
        }
        debug!(instance_id = %self.instance_id, "elector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpg_storage::MemoryStore;

    fn elector(
        store: &Arc<MemoryStore>,
        instance_id: Uuid,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (LeaderElector, watch::Receiver<bool>) {
        LeaderElector::new(
            Arc::clone(store) as Arc<dyn Store>,
            instance_id,
            Duration::from_secs(30),
            Duration::from_secs(10),
            Duration::from_secs(5),
            shutdown_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn single_leader_among_three() {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (elector, leadership_rx) = elector(&store, Uuid::now_v7(), shutdown_rx.clone());
            receivers.push(leadership_rx);
            handles.push(tokio::spawn(elector.run()));
        }

        // Let several election periods elapse
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            let leaders = receivers.iter().filter(|r| *r.borrow()).count();
            assert!(leaders <= 1, "more than one leader at once");
        }
        let leaders = receivers.iter().filter(|r| *r.borrow()).count();
        assert_eq!(leaders, 1, "no leader elected");

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        // The leader resigned on stop
        assert!(store.get_leader().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn successor_takes_over_after_clean_exit() {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_a_tx, shutdown_a_rx) = watch::channel(false);
        let (shutdown_b_tx, shutdown_b_rx) = watch::channel(false);

        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let (elector_a, leadership_a) = elector(&store, a, shutdown_a_rx);
        let handle_a = tokio::spawn(elector_a.run());

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(*leadership_a.borrow());

        let (elector_b, leadership_b) = elector(&store, b, shutdown_b_rx);
        let handle_b = tokio::spawn(elector_b.run());

        // A exits cleanly and resigns; B wins within one election period
        shutdown_a_tx.send(true).unwrap();
        handle_a.await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(*leadership_b.borrow());
        assert_eq!(
            store.get_leader().await.unwrap().unwrap().leader_instance_id,
            b
        );

        shutdown_b_tx.send(true).unwrap();
        handle_b.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let dead = Uuid::now_v7();
        // A lease from an instance that will never renew
        store
            .leader_attempt_elect(dead, Duration::from_secs(30))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (elector_b, leadership_b) = elector(&store, Uuid::now_v7(), shutdown_rx);
        let handle = tokio::spawn(elector_b.run());

        // Before expiry: seat taken
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!*leadership_b.borrow());

        // After expiry (store clock past the TTL): the next attempt wins
        store.advance_clock(Duration::from_secs(31));
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(*leadership_b.borrow());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
