//! Store trait definition
//!
//! The engine interacts with persistence only through this trait. Every
//! multi-row operation is a single transaction; implementations must be
//! thread-safe and must never hand the same claimable row to two callers.
//! All lease and staleness comparisons use the database clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agentpg_core::{
    AgentDefinition, CompactionEvent, ContentBlock, Instance, Iteration, IterationResult, Leader,
    Message, NewInstance, NewMessage, NewRun, NewSession, NewToolExecution, Run, RunMode, RunState,
    RunUpdates, Session, ToolDefinition, ToolExecution,
};

use crate::notify::{Notification, NotifyChannel};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// A transition the state machines reject
    #[error("invalid transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    /// A precondition of a compound operation did not hold
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn invalid_transition(
        kind: &'static str,
        id: Uuid,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            kind,
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<StoreError> for agentpg_core::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => agentpg_core::EngineError::not_found(kind, id),
            other => agentpg_core::EngineError::storage(other.to_string()),
        }
    }
}

/// Input for recording a compaction event
#[derive(Debug, Clone)]
pub struct NewCompactionEvent {
    pub session_id: Uuid,
    pub preserved_message_ids: Vec<Uuid>,
    pub summary_message_id: Option<Uuid>,
    pub strategy: String,
    pub duration_ms: i64,
}

/// Outcome of failing a tool execution
#[derive(Debug, Clone)]
pub enum ToolFailureOutcome {
    /// Attempts remain; the row went back to `pending` at `scheduled_at`
    WillRetry {
        next_attempt: i32,
        scheduled_at: DateTime<Utc>,
    },

    /// Attempt budget exhausted; the row is terminally `failed`
    Failed(ToolExecution),
}

/// Store for all engine state
///
/// Implementations: [`crate::PostgresStore`] for production,
/// [`crate::MemoryStore`] for tests and embedded use.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a session. Rejects duplicate (tenant, identifier) pairs.
    async fn create_session(&self, new: NewSession) -> Result<Session, StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError>;

    async fn find_session(
        &self,
        tenant: &str,
        identifier: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Bump the session's updated_at.
    async fn touch_session(&self, id: Uuid) -> Result<(), StoreError>;

    async fn increment_session_compaction(&self, id: Uuid) -> Result<(), StoreError>;

    async fn record_compaction_event(
        &self,
        event: NewCompactionEvent,
    ) -> Result<CompactionEvent, StoreError>;

    // =========================================================================
    // Messages
    // =========================================================================

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: Uuid) -> Result<Message, StoreError>;

    /// Context for a root run: messages of all depth-0 runs in the session,
    /// oldest first. Archived messages are excluded.
    async fn list_root_context(&self, session_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Context for a nested run: that run's messages only, oldest first.
    async fn list_run_messages(&self, run_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Sum of token usage across the session's live messages.
    async fn session_token_count(&self, session_id: Uuid) -> Result<i64, StoreError>;

    /// Compaction delete-and-archive: the ids stop appearing in context
    /// queries but remain recoverable.
    async fn archive_messages(&self, message_ids: &[Uuid]) -> Result<(), StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, new: NewRun) -> Result<Run, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError>;

    /// Atomically claim up to `max_count` runs in `pending` or
    /// `awaiting_continuation` with `scheduled_at <= now`, FIFO by
    /// `scheduled_at` then `created_at`. Sets `pending_api`, the claim
    /// fields, and `started_at` if null. Never hands a row to two callers.
    async fn claim_runs(
        &self,
        instance_id: Uuid,
        max_count: usize,
        run_mode: Option<RunMode>,
    ) -> Result<Vec<Run>, StoreError>;

    /// Validated state transition. Sets `previous_state`, stamps
    /// `finalized_at` on terminals, clears claim fields when leaving a
    /// workable state, applies `updates`, and emits `agentpg_run_state`.
    async fn update_run_state(
        &self,
        run_id: Uuid,
        to: RunState,
        updates: RunUpdates,
    ) -> Result<Run, StoreError>;

    /// Explicit cancellation: run -> cancelled, every non-terminal tool
    /// execution of the run -> skipped, in one transaction.
    async fn cancel_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    /// Runs claimed longer than `timeout` with rescue budget remaining.
    async fn get_stuck_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError>;

    /// Runs claimed longer than `timeout` that already spent their rescue
    /// budget; cleanup fails these with `ErrorType::Orphan`.
    async fn get_rescue_exhausted_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError>;

    /// Back to `pending`: clears claim fields, increments `rescue_attempts`,
    /// stamps `last_rescue_at`.
    async fn rescue_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    /// Runs sitting in `pending_tools` although no non-terminal execution
    /// remains for their current iteration (the missed-notification case).
    async fn get_stuck_pending_tools_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    // =========================================================================
    // Iterations
    // =========================================================================

    /// Open the next iteration for a run; numbers are dense from 0. Also
    /// points the run's `current_iteration_id` at the new row.
    async fn create_iteration(
        &self,
        run_id: Uuid,
        is_streaming: bool,
        request_message_ids: Vec<Uuid>,
    ) -> Result<Iteration, StoreError>;

    /// Close an iteration with its LLM result.
    async fn complete_iteration(
        &self,
        iteration_id: Uuid,
        result: IterationResult,
    ) -> Result<Iteration, StoreError>;

    async fn record_iteration_error(
        &self,
        iteration_id: Uuid,
        error_type: agentpg_core::ErrorType,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn get_iteration(&self, id: Uuid) -> Result<Iteration, StoreError>;

    /// Batch-mode bookkeeping: record the provider batch id on submission.
    async fn record_batch_submitted(
        &self,
        iteration_id: Uuid,
        batch_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Batch-mode bookkeeping: record a poll and the observed status.
    async fn record_batch_poll(
        &self,
        iteration_id: Uuid,
        status: agentpg_core::BatchStatus,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Tool executions
    // =========================================================================

    /// Atomically insert N executions and transition the run, rejecting if
    /// the source-to-target transition is invalid. Emits
    /// `agentpg_tool_pending` per inserted row.
    async fn create_tool_executions_and_update_run_state(
        &self,
        params: Vec<NewToolExecution>,
        run_id: Uuid,
        target_state: RunState,
        updates: RunUpdates,
    ) -> Result<Vec<ToolExecution>, StoreError>;

    /// Atomically claim up to `max_count` pending executions with
    /// `scheduled_at <= now`; sets `running` and increments `attempt_count`.
    async fn claim_tool_executions(
        &self,
        instance_id: Uuid,
        max_count: usize,
    ) -> Result<Vec<ToolExecution>, StoreError>;

    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution, StoreError>;

    async fn list_iteration_tool_executions(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<ToolExecution>, StoreError>;

    /// running -> completed with output; performs fan-in when this was the
    /// last non-terminal execution of the run's current iteration.
    async fn complete_tool_execution(
        &self,
        id: Uuid,
        output: &str,
    ) -> Result<ToolExecution, StoreError>;

    /// running -> failed. When attempts remain the row is rescheduled to
    /// `pending` at `retry_at`; otherwise the failure is terminal and fan-in
    /// runs as for completion.
    async fn fail_tool_execution(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<ToolFailureOutcome, StoreError>;

    /// Cooperative delay: back to `pending` at `until`, decrementing
    /// `attempt_count` (floor 0) and incrementing `snooze_count`.
    async fn snooze_tool_execution(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<ToolExecution, StoreError>;

    /// Record the child run created for an agent-as-tool execution; the
    /// execution stays `running`.
    async fn set_tool_execution_child_run(
        &self,
        id: Uuid,
        child_run_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Single transaction: insert one assistant message holding the
    /// tool_result blocks, verify every execution of the run's current
    /// iteration is terminal, transition `pending_tools -> pending_api`,
    /// emit `agentpg_run_state`. Rejects when preconditions fail.
    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<Message, StoreError>;

    // =========================================================================
    // Instances
    // =========================================================================

    async fn register_instance(&self, new: NewInstance) -> Result<Instance, StoreError>;

    /// Refresh `last_heartbeat_at` to the database clock.
    async fn heartbeat_instance(&self, id: Uuid) -> Result<(), StoreError>;

    /// Delete the instance row and release its claims: claimed non-terminal
    /// runs go back to their claimable state, running executions back to
    /// `pending`. Rescue counters are not incremented for a clean release.
    async fn deregister_instance(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;

    /// Instances whose heartbeat is older than `ttl`.
    async fn list_stale_instances(&self, ttl: Duration) -> Result<Vec<Instance>, StoreError>;

    // =========================================================================
    // Leader lease
    // =========================================================================

    /// Insert the lease row if absent (expired rows are cleared first in the
    /// same transaction). Returns true iff this instance became leader.
    async fn leader_attempt_elect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lease, but only while this instance still holds an
    /// unexpired one. Returns true iff renewed.
    async fn leader_attempt_reelect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if held by this instance.
    async fn leader_resign(&self, instance_id: Uuid) -> Result<(), StoreError>;

    /// Remove expired lease rows. Returns the number removed.
    async fn leader_delete_expired(&self) -> Result<u64, StoreError>;

    async fn get_leader(&self) -> Result<Option<Leader>, StoreError>;

    // =========================================================================
    // Agent / tool registry
    // =========================================================================

    async fn upsert_agent(&self, def: &AgentDefinition) -> Result<(), StoreError>;

    async fn get_agent(&self, name: &str) -> Result<Option<AgentDefinition>, StoreError>;

    async fn link_instance_agent(
        &self,
        instance_id: Uuid,
        agent_name: &str,
    ) -> Result<(), StoreError>;

    async fn upsert_tool(&self, def: &ToolDefinition) -> Result<(), StoreError>;

    async fn link_instance_tool(
        &self,
        instance_id: Uuid,
        tool_name: &str,
    ) -> Result<(), StoreError>;

    /// Tools available on at least one live instance (heartbeat within `ttl`).
    async fn list_fleet_tools(&self, ttl: Duration) -> Result<Vec<ToolDefinition>, StoreError>;

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Subscribe to a notification channel. Deliveries are wake-up hints
    /// only; correctness never depends on receiving one.
    fn subscribe(&self, channel: NotifyChannel) -> tokio::sync::broadcast::Receiver<Notification>;
}
