// Engine configuration
//
// One config struct covers the worker pools, polling cadences, fleet
// membership, leader election, and cleanup thresholds. Leases and staleness
// thresholds are compared against the database clock, so they only need to
// exceed worst-case clock skew between app instances, not wall-clock drift.

use std::time::Duration;

use crate::error::{EngineError, Result};

/// Hard cap on agent-as-tool nesting.
pub const MAX_DEPTH_LIMIT: i32 = 10;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run-worker pool size
    pub max_concurrent_runs: usize,

    /// Tool-worker pool size
    pub max_concurrent_tools: usize,

    /// Fallback poll cadence when no run notification arrives
    pub run_poll_interval: Duration,

    /// Fallback poll cadence when no tool notification arrives
    pub tool_poll_interval: Duration,

    /// Instance heartbeat cadence
    pub heartbeat_interval: Duration,

    /// Staleness threshold for instances
    pub instance_ttl: Duration,

    /// Leader lease duration
    pub leader_ttl: Duration,

    /// Non-leader retry cadence
    pub election_period: Duration,

    /// Leader renewal cadence; must be strictly less than `leader_ttl`
    pub reelection_delay: Duration,

    /// Leader-only cleanup cadence
    pub cleanup_interval: Duration,

    /// Rescue threshold for claimed runs
    pub stuck_run_timeout: Duration,

    /// Give up and fail a run after this many rescues
    pub max_rescue_attempts: i32,

    /// Per-tool-execution deadline
    pub tool_timeout: Duration,

    /// Default attempts per tool execution
    pub max_tool_attempts: i32,

    /// Upper bound on runs/tools claimed per poll (further bounded by free slots)
    pub claim_batch_size: usize,

    /// Hard cap on agent-as-tool nesting depth
    pub max_depth: i32,

    /// Session token count that triggers auto-compaction
    pub compaction_trigger: i64,

    /// How long `stop` waits for in-flight handlers to drain
    pub shutdown_grace: Duration,

    /// Optional human-readable instance name
    pub instance_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            max_concurrent_tools: 50,
            run_poll_interval: Duration::from_secs(1),
            tool_poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            instance_ttl: Duration::from_secs(120),
            leader_ttl: Duration::from_secs(30),
            election_period: Duration::from_secs(10),
            reelection_delay: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            stuck_run_timeout: Duration::from_secs(3600),
            max_rescue_attempts: 3,
            tool_timeout: Duration::from_secs(300),
            max_tool_attempts: 2,
            claim_batch_size: 10,
            max_depth: MAX_DEPTH_LIMIT,
            compaction_trigger: 150_000,
            shutdown_grace: Duration::from_secs(30),
            instance_name: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn with_max_concurrent_tools(mut self, max: usize) -> Self {
        self.max_concurrent_tools = max;
        self
    }

    pub fn with_run_poll_interval(mut self, interval: Duration) -> Self {
        self.run_poll_interval = interval;
        self
    }

    pub fn with_tool_poll_interval(mut self, interval: Duration) -> Self {
        self.tool_poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_instance_ttl(mut self, ttl: Duration) -> Self {
        self.instance_ttl = ttl;
        self
    }

    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self
    }

    pub fn with_election_period(mut self, period: Duration) -> Self {
        self.election_period = period;
        self
    }

    pub fn with_reelection_delay(mut self, delay: Duration) -> Self {
        self.reelection_delay = delay;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_stuck_run_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_run_timeout = timeout;
        self
    }

    pub fn with_max_rescue_attempts(mut self, attempts: i32) -> Self {
        self.max_rescue_attempts = attempts;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_tool_attempts(mut self, attempts: i32) -> Self {
        self.max_tool_attempts = attempts;
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size.max(1);
        self
    }

    pub fn with_max_depth(mut self, depth: i32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_compaction_trigger(mut self, tokens: i64) -> Self {
        self.compaction_trigger = tokens;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.reelection_delay >= self.leader_ttl {
            return Err(EngineError::validation(format!(
                "reelection_delay ({:?}) must be strictly less than leader_ttl ({:?})",
                self.reelection_delay, self.leader_ttl
            )));
        }
        if self.max_concurrent_runs == 0 {
            return Err(EngineError::validation("max_concurrent_runs must be > 0"));
        }
        if self.max_concurrent_tools == 0 {
            return Err(EngineError::validation("max_concurrent_tools must be > 0"));
        }
        if self.max_depth < 0 || self.max_depth > MAX_DEPTH_LIMIT {
            return Err(EngineError::validation(format!(
                "max_depth must be within 0..={}",
                MAX_DEPTH_LIMIT
            )));
        }
        if self.max_tool_attempts < 1 {
            return Err(EngineError::validation("max_tool_attempts must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(config.max_concurrent_tools, 50);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.leader_ttl, Duration::from_secs(30));
        assert_eq!(config.stuck_run_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_tool_attempts, 2);
    }

    #[test]
    fn reelection_delay_must_undercut_ttl() {
        let config = EngineConfig::default()
            .with_leader_ttl(Duration::from_secs(10))
            .with_reelection_delay(Duration::from_secs(10));
        assert!(config.validate().is_err());

        let config = EngineConfig::default()
            .with_leader_ttl(Duration::from_secs(10))
            .with_reelection_delay(Duration::from_secs(9));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn depth_cap_enforced() {
        let config = EngineConfig::default().with_max_depth(MAX_DEPTH_LIMIT + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_pools_rejected() {
        assert!(EngineConfig::default()
            .with_max_concurrent_runs(0)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_max_concurrent_tools(0)
            .validate()
            .is_err());
    }
}
