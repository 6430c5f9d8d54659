//! In-memory implementation of the Store trait
//!
//! Primarily for tests and embedded use. Provides the same semantics as the
//! PostgreSQL implementation, including fan-in, child-run completion (the
//! trigger replica), rescue, and the leader lease. All state lives behind a
//! single lock, which trivially gives the claim operations their
//! no-double-hand-out guarantee.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use agentpg_core::{
    joined_text, AgentDefinition, BatchStatus, CompactionEvent, ContentBlock, ErrorType, Instance,
    Iteration, IterationResult, Leader, Message, MessageRole, NewInstance, NewMessage, NewRun,
    NewSession, NewToolExecution, Run, RunMode, RunState, RunUpdates, Session, TokenUsage,
    ToolDefinition, ToolExecution, ToolExecutionState, LEADER_NAME,
};

use crate::notify::{Notification, NotifyChannel, NotifyHub};
use crate::store::{NewCompactionEvent, Store, StoreError, ToolFailureOutcome};

struct StoredMessage {
    message: Message,
    archived_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Session>,
    messages: HashMap<Uuid, StoredMessage>,
    runs: HashMap<Uuid, Run>,
    iterations: HashMap<Uuid, Iteration>,
    executions: HashMap<Uuid, ToolExecution>,
    instances: HashMap<Uuid, Instance>,
    leader: Option<Leader>,
    agents: HashMap<String, AgentDefinition>,
    tools: HashMap<String, ToolDefinition>,
    instance_agents: HashSet<(Uuid, String)>,
    instance_tools: HashSet<(Uuid, String)>,
    compaction_events: Vec<CompactionEvent>,
}

/// In-memory implementation of the Store trait
///
/// # Example
///
/// ```
/// use agentpg_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    inner: RwLock<Inner>,
    hub: NotifyHub,
    clock_offset: RwLock<chrono::Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            hub: NotifyHub::new(),
            clock_offset: RwLock::new(chrono::Duration::zero()),
        }
    }

    /// The store's clock: the "database clock" every comparison uses.
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.read()
    }

    /// Shift the store clock forward. Tests use this to expire leases,
    /// claims, and heartbeats without waiting wall-clock time.
    pub fn advance_clock(&self, delta: Duration) {
        let mut offset = self.clock_offset.write();
        *offset = *offset + chrono::Duration::from_std(delta).unwrap_or_default();
    }

    /// Number of runs, for test assertions
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Snapshot of all runs, newest last, for test assertions
    pub fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.inner.read().runs.values().cloned().collect();
        runs.sort_by_key(|r| (r.created_at, r.id));
        runs
    }

    /// Number of tool executions, for test assertions
    pub fn tool_execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    fn notify_run(&self, run: &Run) {
        self.hub.publish(Notification::RunState {
            run_id: run.id,
            state: run.state,
        });
    }

    fn notify_tool_pending(&self, execution_id: Uuid) {
        self.hub.publish(Notification::ToolPending {
            tool_execution_id: execution_id,
        });
    }

    /// Validated run transition; the single mutation point for run state.
    /// Mirrors update_run_state in the PostgreSQL store plus its triggers.
    fn transition_run(
        &self,
        inner: &mut Inner,
        run_id: Uuid,
        to: RunState,
        updates: RunUpdates,
    ) -> Result<Run, StoreError> {
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id))?;

        if !run.state.can_transition_to(to) {
            return Err(StoreError::invalid_transition("run", run_id, run.state, to));
        }

        let now = self.now();
        run.previous_state = Some(run.state);
        run.state = to;
        if let Some(iteration_id) = updates.current_iteration_id {
            run.current_iteration_id = Some(iteration_id);
        }
        if let Some(message) = updates.error_message {
            run.error_message = Some(message);
        }
        if let Some(error_type) = updates.error_type {
            run.error_type = Some(error_type);
        }
        if let Some(delta) = updates.usage_delta {
            run.usage.add(delta);
        }
        if updates.increment_tool_iterations {
            run.tool_iterations += 1;
        }
        if to != RunState::PendingApi {
            run.claimed_by_instance_id = None;
            run.claimed_at = None;
        }
        if to.is_terminal() {
            run.finalized_at = Some(now);
        }
        run.updated_at = now;

        let snapshot = run.clone();
        self.notify_run(&snapshot);

        // Trigger replica: a terminal child run completes its parent tool
        // execution
        if to.is_terminal() {
            if let Some(parent_execution_id) = snapshot.parent_tool_execution_id {
                self.child_run_complete(inner, &snapshot, parent_execution_id);
            }
        }

        Ok(snapshot)
    }

    fn child_run_complete(&self, inner: &mut Inner, child: &Run, execution_id: Uuid) {
        let Some(execution) = inner.executions.get_mut(&execution_id) else {
            return;
        };
        if execution.state != ToolExecutionState::Running {
            return;
        }

        let now = self.now();
        if child.state == RunState::Completed {
            let output = inner
                .messages
                .values()
                .filter(|m| {
                    m.message.run_id == Some(child.id) && m.message.role == MessageRole::Assistant
                })
                .max_by_key(|m| (m.message.created_at, m.message.id))
                .map(|m| joined_text(&m.message.content))
                .unwrap_or_default();
            execution.state = ToolExecutionState::Completed;
            execution.tool_output = Some(output);
            execution.is_error = false;
        } else {
            let error = child
                .error_message
                .clone()
                .unwrap_or_else(|| format!("child run {}", child.state));
            execution.state = ToolExecutionState::Failed;
            execution.is_error = true;
            execution.error_message = Some(error.clone());
            execution.last_error = Some(error);
            // Child-run failures are not re-dispatched
            execution.attempt_count = execution.max_attempts;
        }
        execution.updated_at = now;

        let execution = execution.clone();
        self.tool_fanin(inner, &execution);
    }

    /// Trigger replica: when the last non-terminal execution of the current
    /// iteration becomes terminal, continue the run.
    fn tool_fanin(&self, inner: &mut Inner, execution: &ToolExecution) {
        let Some(run) = inner.runs.get(&execution.run_id) else {
            return;
        };
        if run.state != RunState::PendingTools
            || run.current_iteration_id != Some(execution.iteration_id)
        {
            return;
        }

        let remaining = inner
            .executions
            .values()
            .filter(|e| e.iteration_id == execution.iteration_id && !e.state.is_terminal())
            .count();
        if remaining > 0 {
            return;
        }

        let run_id = run.id;
        let session_id = run.session_id;
        let iteration_id = execution.iteration_id;

        let mut results: Vec<&ToolExecution> = inner
            .executions
            .values()
            .filter(|e| e.iteration_id == iteration_id)
            .collect();
        results.sort_by_key(|e| (e.created_at, e.id));
        let blocks: Vec<ContentBlock> = results
            .iter()
            .map(|e| {
                ContentBlock::tool_result(
                    e.tool_use_id.clone(),
                    e.tool_output
                        .clone()
                        .or_else(|| e.error_message.clone())
                        .unwrap_or_default(),
                    e.state != ToolExecutionState::Completed || e.is_error,
                )
            })
            .collect();

        self.insert_message_locked(
            inner,
            NewMessage {
                session_id,
                run_id: Some(run_id),
                role: MessageRole::Assistant,
                content: blocks,
                usage: None,
                preserved: false,
                summary: false,
            },
        );

        // pending_tools -> pending_api with the claim released
        let _ = self.transition_run(inner, run_id, RunState::PendingApi, RunUpdates::default());
    }

    fn insert_message_locked(&self, inner: &mut Inner, new: NewMessage) -> Message {
        let message = Message {
            id: Uuid::now_v7(),
            session_id: new.session_id,
            run_id: new.run_id,
            role: new.role,
            content: new.content,
            usage: new.usage,
            preserved: new.preserved,
            summary: new.summary,
            created_at: self.now(),
        };
        inner.messages.insert(
            message.id,
            StoredMessage {
                message: message.clone(),
                archived_at: None,
            },
        );
        message
    }

    fn leader_is_current(leader: &Leader, now: DateTime<Utc>) -> bool {
        leader.expires_at > now
    }
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Sessions
    // =========================================================================

    async fn create_session(&self, new: NewSession) -> Result<Session, StoreError> {
        let mut inner = self.inner.write();
        if inner
            .sessions
            .values()
            .any(|s| s.tenant == new.tenant && s.identifier == new.identifier)
        {
            return Err(StoreError::Precondition(format!(
                "session already exists for tenant '{}' identifier '{}'",
                new.tenant, new.identifier
            )));
        }
        let now = self.now();
        let session = Session {
            id: Uuid::now_v7(),
            tenant: new.tenant,
            identifier: new.identifier,
            parent_session_id: new.parent_session_id,
            depth: new.depth,
            metadata: new.metadata,
            compaction_count: 0,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        self.inner
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    async fn find_session(
        &self,
        tenant: &str,
        identifier: &str,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .read()
            .sessions
            .values()
            .find(|s| s.tenant == tenant && s.identifier == identifier)
            .cloned())
    }

    async fn touch_session(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(session) = self.inner.write().sessions.get_mut(&id) {
            session.updated_at = self.now();
        }
        Ok(())
    }

    async fn increment_session_compaction(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(session) = self.inner.write().sessions.get_mut(&id) {
            session.compaction_count += 1;
            session.updated_at = self.now();
        }
        Ok(())
    }

    async fn record_compaction_event(
        &self,
        event: NewCompactionEvent,
    ) -> Result<CompactionEvent, StoreError> {
        let stored = CompactionEvent {
            id: Uuid::now_v7(),
            session_id: event.session_id,
            preserved_message_ids: event.preserved_message_ids,
            summary_message_id: event.summary_message_id,
            strategy: event.strategy,
            duration_ms: event.duration_ms,
            created_at: self.now(),
        };
        self.inner.write().compaction_events.push(stored.clone());
        Ok(stored)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.write();
        Ok(self.insert_message_locked(&mut inner, new))
    }

    async fn get_message(&self, id: Uuid) -> Result<Message, StoreError> {
        self.inner
            .read()
            .messages
            .get(&id)
            .map(|m| m.message.clone())
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    async fn list_root_context(&self, session_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.archived_at.is_none() && m.message.session_id == session_id)
            .filter(|m| match m.message.run_id {
                None => true,
                Some(run_id) => inner.runs.get(&run_id).is_some_and(|r| r.depth == 0),
            })
            .map(|m| m.message.clone())
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        Ok(messages)
    }

    async fn list_run_messages(&self, run_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.archived_at.is_none() && m.message.run_id == Some(run_id))
            .map(|m| m.message.clone())
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        Ok(messages)
    }

    async fn session_token_count(&self, session_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .read()
            .messages
            .values()
            .filter(|m| m.archived_at.is_none() && m.message.session_id == session_id)
            .filter_map(|m| m.message.usage)
            .map(|u| u.total())
            .sum())
    }

    async fn archive_messages(&self, message_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();
        for id in message_ids {
            if let Some(stored) = inner.messages.get_mut(id) {
                stored.archived_at = Some(now);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, new: NewRun) -> Result<Run, StoreError> {
        let now = self.now();
        let run = Run {
            id: Uuid::now_v7(),
            session_id: new.session_id,
            agent_name: new.agent_name,
            prompt: new.prompt,
            run_mode: new.run_mode,
            parent_run_id: new.parent_run_id,
            parent_tool_execution_id: new.parent_tool_execution_id,
            depth: new.depth,
            state: RunState::Pending,
            previous_state: None,
            current_iteration_id: None,
            tool_iterations: 0,
            usage: TokenUsage::default(),
            error_message: None,
            error_type: None,
            created_by_instance_id: new.created_by_instance_id,
            claimed_by_instance_id: None,
            claimed_at: None,
            rescue_attempts: 0,
            last_rescue_at: None,
            scheduled_at: now,
            started_at: None,
            finalized_at: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write();
        inner.runs.insert(run.id, run.clone());
        // The prompt enters the conversation with the run
        self.insert_message_locked(
            &mut inner,
            NewMessage {
                session_id: run.session_id,
                run_id: Some(run.id),
                role: MessageRole::User,
                content: vec![ContentBlock::text(run.prompt.clone())],
                usage: None,
                preserved: false,
                summary: false,
            },
        );
        drop(inner);
        self.notify_run(&run);
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        self.inner
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    async fn claim_runs(
        &self,
        instance_id: Uuid,
        max_count: usize,
        run_mode: Option<RunMode>,
    ) -> Result<Vec<Run>, StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();

        let mut candidates: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.scheduled_at <= now)
            .filter(|r| {
                r.state.is_claimable()
                    || (r.state == RunState::PendingApi && r.claimed_by_instance_id.is_none())
            })
            .filter(|r| run_mode.is_none_or(|m| r.run_mode == m))
            .map(|r| r.id)
            .collect();
        candidates.sort_by_key(|id| {
            let r = &inner.runs[id];
            (r.scheduled_at, r.created_at, r.id)
        });
        candidates.truncate(max_count);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let run = inner.runs.get_mut(&id).expect("candidate exists");
            if run.state != RunState::PendingApi {
                run.previous_state = Some(run.state);
                run.state = RunState::PendingApi;
            }
            run.claimed_by_instance_id = Some(instance_id);
            run.claimed_at = Some(now);
            run.started_at.get_or_insert(now);
            run.updated_at = now;
            let snapshot = run.clone();
            self.notify_run(&snapshot);
            claimed.push(snapshot);
        }
        Ok(claimed)
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        to: RunState,
        updates: RunUpdates,
    ) -> Result<Run, StoreError> {
        let mut inner = self.inner.write();
        self.transition_run(&mut inner, run_id, to, updates)
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let mut inner = self.inner.write();

        let cancelled = self.transition_run(
            &mut inner,
            run_id,
            RunState::Cancelled,
            RunUpdates {
                error_message: Some("run cancelled".into()),
                error_type: Some(ErrorType::Cancelled),
                ..Default::default()
            },
        )?;

        let now = self.now();
        for execution in inner.executions.values_mut() {
            if execution.run_id == run_id && !execution.state.is_terminal() {
                execution.state = ToolExecutionState::Skipped;
                execution.claimed_by_instance_id = None;
                execution.claimed_at = None;
                execution.updated_at = now;
            }
        }
        Ok(cancelled)
    }

    async fn get_stuck_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let cutoff = self.now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let inner = self.inner.read();
        let mut stuck: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| {
                !r.state.is_terminal()
                    && r.claimed_by_instance_id.is_some()
                    && r.claimed_at.is_some_and(|at| at < cutoff)
                    && r.rescue_attempts < max_rescue_attempts
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.claimed_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn get_rescue_exhausted_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let cutoff = self.now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let inner = self.inner.read();
        let mut exhausted: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| {
                !r.state.is_terminal()
                    && r.claimed_by_instance_id.is_some()
                    && r.claimed_at.is_some_and(|at| at < cutoff)
                    && r.rescue_attempts >= max_rescue_attempts
            })
            .cloned()
            .collect();
        exhausted.sort_by_key(|r| r.claimed_at);
        exhausted.truncate(limit);
        Ok(exhausted)
    }

    async fn rescue_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let mut inner = self.inner.write();
        let rescued =
            self.transition_run(&mut inner, run_id, RunState::Pending, RunUpdates::default())?;
        let run = inner.runs.get_mut(&run_id).expect("just transitioned");
        run.rescue_attempts += 1;
        run.last_rescue_at = Some(self.now());
        Ok(Run {
            rescue_attempts: run.rescue_attempts,
            last_rescue_at: run.last_rescue_at,
            ..rescued
        })
    }

    async fn get_stuck_pending_tools_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.read();
        let mut stuck: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.state == RunState::PendingTools)
            .filter(|r| {
                !inner.executions.values().any(|e| {
                    Some(e.iteration_id) == r.current_iteration_id && !e.state.is_terminal()
                })
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    // =========================================================================
    // Iterations
    // =========================================================================

    async fn create_iteration(
        &self,
        run_id: Uuid,
        is_streaming: bool,
        request_message_ids: Vec<Uuid>,
    ) -> Result<Iteration, StoreError> {
        let mut inner = self.inner.write();
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::not_found("run", run_id));
        }

        let next_number = inner
            .iterations
            .values()
            .filter(|i| i.run_id == run_id)
            .map(|i| i.iteration_number + 1)
            .max()
            .unwrap_or(0);

        let iteration = Iteration {
            id: Uuid::now_v7(),
            run_id,
            iteration_number: next_number,
            is_streaming,
            batch_id: None,
            batch_status: None,
            batch_submitted_at: None,
            batch_completed_at: None,
            batch_expires_at: None,
            poll_count: 0,
            request_message_ids,
            response_message_id: None,
            stop_reason: None,
            has_tool_use: false,
            tool_execution_count: 0,
            usage: None,
            error_message: None,
            error_type: None,
            started_at: self.now(),
            completed_at: None,
        };
        inner.iterations.insert(iteration.id, iteration.clone());

        let run = inner.runs.get_mut(&run_id).expect("checked above");
        run.current_iteration_id = Some(iteration.id);
        run.updated_at = self.now();
        Ok(iteration)
    }

    async fn complete_iteration(
        &self,
        iteration_id: Uuid,
        result: IterationResult,
    ) -> Result<Iteration, StoreError> {
        let mut inner = self.inner.write();
        let iteration = inner
            .iterations
            .get_mut(&iteration_id)
            .ok_or_else(|| StoreError::not_found("iteration", iteration_id))?;
        iteration.response_message_id = Some(result.response_message_id);
        iteration.stop_reason = Some(result.stop_reason);
        iteration.has_tool_use = result.has_tool_use;
        iteration.tool_execution_count = result.tool_execution_count;
        iteration.usage = Some(result.usage);
        iteration.completed_at = Some(self.now());
        Ok(iteration.clone())
    }

    async fn record_iteration_error(
        &self,
        iteration_id: Uuid,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(iteration) = inner.iterations.get_mut(&iteration_id) {
            iteration.error_message = Some(message.to_string());
            iteration.error_type = Some(error_type);
            iteration.completed_at = Some(self.now());
        }
        Ok(())
    }

    async fn get_iteration(&self, id: Uuid) -> Result<Iteration, StoreError> {
        self.inner
            .read()
            .iterations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("iteration", id))
    }

    async fn record_batch_submitted(
        &self,
        iteration_id: Uuid,
        batch_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let iteration = inner
            .iterations
            .get_mut(&iteration_id)
            .ok_or_else(|| StoreError::not_found("iteration", iteration_id))?;
        iteration.batch_id = Some(batch_id.to_string());
        iteration.batch_status = Some(BatchStatus::Submitted);
        iteration.batch_submitted_at = Some(self.now());
        iteration.batch_expires_at = expires_at;
        drop(inner);
        self.hub
            .publish(Notification::IterationPoll { iteration_id });
        Ok(())
    }

    async fn record_batch_poll(
        &self,
        iteration_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let iteration = inner
            .iterations
            .get_mut(&iteration_id)
            .ok_or_else(|| StoreError::not_found("iteration", iteration_id))?;
        if status == BatchStatus::Ended {
            iteration.batch_completed_at = Some(self.now());
        }
        iteration.batch_status = Some(status);
        iteration.poll_count += 1;
        Ok(())
    }

    // =========================================================================
    // Tool executions
    // =========================================================================

    async fn create_tool_executions_and_update_run_state(
        &self,
        params: Vec<NewToolExecution>,
        run_id: Uuid,
        target_state: RunState,
        updates: RunUpdates,
    ) -> Result<Vec<ToolExecution>, StoreError> {
        if target_state == RunState::PendingTools && params.is_empty() {
            return Err(StoreError::Precondition(
                "pending_tools requires at least one tool execution".into(),
            ));
        }

        let mut inner = self.inner.write();
        {
            let run = inner
                .runs
                .get(&run_id)
                .ok_or_else(|| StoreError::not_found("run", run_id))?;
            if !run.state.can_transition_to(target_state) {
                return Err(StoreError::invalid_transition(
                    "run",
                    run_id,
                    run.state,
                    target_state,
                ));
            }
        }

        let now = self.now();
        let mut executions = Vec::with_capacity(params.len());
        for param in params {
            let execution = ToolExecution {
                id: Uuid::now_v7(),
                run_id: param.run_id,
                iteration_id: param.iteration_id,
                state: ToolExecutionState::Pending,
                tool_use_id: param.tool_use_id,
                tool_name: param.tool_name,
                tool_input: param.tool_input,
                is_agent_tool: param.is_agent_tool,
                agent_name: param.agent_name,
                child_run_id: None,
                tool_output: None,
                is_error: false,
                error_message: None,
                claimed_by_instance_id: None,
                claimed_at: None,
                attempt_count: 0,
                max_attempts: param.max_attempts,
                scheduled_at: now,
                snooze_count: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            inner.executions.insert(execution.id, execution.clone());
            executions.push(execution);
        }

        self.transition_run(&mut inner, run_id, target_state, updates)?;

        for execution in &executions {
            self.notify_tool_pending(execution.id);
        }
        Ok(executions)
    }

    async fn claim_tool_executions(
        &self,
        instance_id: Uuid,
        max_count: usize,
    ) -> Result<Vec<ToolExecution>, StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();

        let mut candidates: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| e.state == ToolExecutionState::Pending && e.scheduled_at <= now)
            .map(|e| e.id)
            .collect();
        candidates.sort_by_key(|id| {
            let e = &inner.executions[id];
            (e.scheduled_at, e.created_at, e.id)
        });
        candidates.truncate(max_count);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let execution = inner.executions.get_mut(&id).expect("candidate exists");
            execution.state = ToolExecutionState::Running;
            execution.claimed_by_instance_id = Some(instance_id);
            execution.claimed_at = Some(now);
            execution.attempt_count += 1;
            execution.updated_at = now;
            claimed.push(execution.clone());
        }
        Ok(claimed)
    }

    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution, StoreError> {
        self.inner
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tool execution", id))
    }

    async fn list_iteration_tool_executions(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<ToolExecution>, StoreError> {
        let inner = self.inner.read();
        let mut executions: Vec<ToolExecution> = inner
            .executions
            .values()
            .filter(|e| e.iteration_id == iteration_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.created_at, e.id));
        Ok(executions)
    }

    async fn complete_tool_execution(
        &self,
        id: Uuid,
        output: &str,
    ) -> Result<ToolExecution, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        if execution.state != ToolExecutionState::Running {
            return Err(StoreError::invalid_transition(
                "tool execution",
                id,
                execution.state,
                ToolExecutionState::Completed,
            ));
        }
        execution.state = ToolExecutionState::Completed;
        execution.tool_output = Some(output.to_string());
        execution.is_error = false;
        execution.updated_at = self.now();
        let snapshot = execution.clone();

        self.tool_fanin(&mut inner, &snapshot);
        Ok(snapshot)
    }

    async fn fail_tool_execution(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<ToolFailureOutcome, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        if execution.state != ToolExecutionState::Running {
            return Err(StoreError::invalid_transition(
                "tool execution",
                id,
                execution.state,
                ToolExecutionState::Failed,
            ));
        }

        let now = self.now();
        if execution.attempt_count < execution.max_attempts {
            execution.state = ToolExecutionState::Pending;
            execution.claimed_by_instance_id = None;
            execution.claimed_at = None;
            execution.last_error = Some(error.to_string());
            execution.scheduled_at = retry_at;
            execution.updated_at = now;
            let next_attempt = execution.attempt_count + 1;
            self.notify_tool_pending(id);
            Ok(ToolFailureOutcome::WillRetry {
                next_attempt,
                scheduled_at: retry_at,
            })
        } else {
            execution.state = ToolExecutionState::Failed;
            execution.is_error = true;
            execution.error_message = Some(error.to_string());
            execution.last_error = Some(error.to_string());
            execution.updated_at = now;
            let snapshot = execution.clone();
            self.tool_fanin(&mut inner, &snapshot);
            Ok(ToolFailureOutcome::Failed(snapshot))
        }
    }

    async fn snooze_tool_execution(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<ToolExecution, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        if execution.state != ToolExecutionState::Running {
            return Err(StoreError::invalid_transition(
                "tool execution",
                id,
                execution.state,
                ToolExecutionState::Pending,
            ));
        }
        execution.state = ToolExecutionState::Pending;
        execution.claimed_by_instance_id = None;
        execution.claimed_at = None;
        execution.attempt_count = (execution.attempt_count - 1).max(0);
        execution.snooze_count += 1;
        execution.scheduled_at = until;
        execution.updated_at = self.now();
        let snapshot = execution.clone();
        self.notify_tool_pending(id);
        Ok(snapshot)
    }

    async fn set_tool_execution_child_run(
        &self,
        id: Uuid,
        child_run_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        if execution.state != ToolExecutionState::Running {
            return Err(StoreError::Precondition(format!(
                "tool execution {} is not running",
                id
            )));
        }
        execution.child_run_id = Some(child_run_id);
        execution.updated_at = self.now();
        Ok(())
    }

    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.write();

        let (run_session, run_state, iteration_id) = {
            let run = inner
                .runs
                .get(&run_id)
                .ok_or_else(|| StoreError::not_found("run", run_id))?;
            (run.session_id, run.state, run.current_iteration_id)
        };
        if run_session != session_id {
            return Err(StoreError::Precondition(format!(
                "run {} does not belong to session {}",
                run_id, session_id
            )));
        }
        if run_state != RunState::PendingTools {
            return Err(StoreError::invalid_transition(
                "run",
                run_id,
                run_state,
                RunState::PendingApi,
            ));
        }
        let remaining = inner
            .executions
            .values()
            .filter(|e| Some(e.iteration_id) == iteration_id && !e.state.is_terminal())
            .count();
        if remaining > 0 {
            return Err(StoreError::Precondition(format!(
                "{} tool executions still non-terminal for run {}",
                remaining, run_id
            )));
        }

        let message = self.insert_message_locked(
            &mut inner,
            NewMessage {
                session_id,
                run_id: Some(run_id),
                role: MessageRole::Assistant,
                content: blocks,
                usage: None,
                preserved: false,
                summary: false,
            },
        );
        self.transition_run(&mut inner, run_id, RunState::PendingApi, RunUpdates::default())?;
        Ok(message)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    async fn register_instance(&self, new: NewInstance) -> Result<Instance, StoreError> {
        let now = self.now();
        let mut inner = self.inner.write();
        let created_at = inner
            .instances
            .get(&new.id)
            .map(|i| i.created_at)
            .unwrap_or(now);
        let instance = Instance {
            id: new.id,
            name: new.name,
            hostname: new.hostname,
            pid: new.pid,
            version: new.version,
            max_concurrent_runs: new.max_concurrent_runs,
            max_concurrent_tools: new.max_concurrent_tools,
            metadata: new.metadata,
            created_at,
            last_heartbeat_at: now,
        };
        inner.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn heartbeat_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("instance", id))?;
        instance.last_heartbeat_at = self.now();
        Ok(())
    }

    async fn deregister_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();

        for run in inner.runs.values_mut() {
            if run.claimed_by_instance_id == Some(id) && run.state == RunState::PendingApi {
                run.claimed_by_instance_id = None;
                run.claimed_at = None;
                run.updated_at = now;
            }
        }

        let released: Vec<Uuid> = inner
            .executions
            .values_mut()
            .filter(|e| {
                e.claimed_by_instance_id == Some(id)
                    && e.state == ToolExecutionState::Running
                    && e.child_run_id.is_none()
            })
            .map(|e| {
                e.state = ToolExecutionState::Pending;
                e.claimed_by_instance_id = None;
                e.claimed_at = None;
                e.updated_at = now;
                e.id
            })
            .collect();

        inner.instances.remove(&id);
        inner.instance_agents.retain(|(i, _)| *i != id);
        inner.instance_tools.retain(|(i, _)| *i != id);
        drop(inner);

        for execution_id in released {
            self.notify_tool_pending(execution_id);
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let mut instances: Vec<Instance> = self.inner.read().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn list_stale_instances(&self, ttl: Duration) -> Result<Vec<Instance>, StoreError> {
        let cutoff = self.now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut stale: Vec<Instance> = self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| i.last_heartbeat_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|i| i.last_heartbeat_at);
        Ok(stale)
    }

    // =========================================================================
    // Leader lease
    // =========================================================================

    async fn leader_attempt_elect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();

        if let Some(leader) = &inner.leader {
            if Self::leader_is_current(leader, now) {
                return Ok(false);
            }
        }

        inner.leader = Some(Leader {
            name: LEADER_NAME.to_string(),
            leader_instance_id: instance_id,
            elected_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        });
        Ok(true)
    }

    async fn leader_attempt_reelect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();

        match &mut inner.leader {
            Some(leader)
                if leader.leader_instance_id == instance_id
                    && Self::leader_is_current(leader, now) =>
            {
                leader.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn leader_resign(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner
            .leader
            .as_ref()
            .is_some_and(|l| l.leader_instance_id == instance_id)
        {
            inner.leader = None;
        }
        Ok(())
    }

    async fn leader_delete_expired(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let now = self.now();
        if inner
            .leader
            .as_ref()
            .is_some_and(|l| !Self::leader_is_current(l, now))
        {
            inner.leader = None;
            return Ok(1);
        }
        Ok(0)
    }

    async fn get_leader(&self) -> Result<Option<Leader>, StoreError> {
        let inner = self.inner.read();
        let now = self.now();
        Ok(inner
            .leader
            .as_ref()
            .filter(|l| Self::leader_is_current(l, now))
            .cloned())
    }

    // =========================================================================
    // Agent / tool registry
    // =========================================================================

    async fn upsert_agent(&self, def: &AgentDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .agents
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentDefinition>, StoreError> {
        Ok(self.inner.read().agents.get(name).cloned())
    }

    async fn link_instance_agent(
        &self,
        instance_id: Uuid,
        agent_name: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .instance_agents
            .insert((instance_id, agent_name.to_string()));
        Ok(())
    }

    async fn upsert_tool(&self, def: &ToolDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .tools
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn link_instance_tool(
        &self,
        instance_id: Uuid,
        tool_name: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .instance_tools
            .insert((instance_id, tool_name.to_string()));
        Ok(())
    }

    async fn list_fleet_tools(&self, ttl: Duration) -> Result<Vec<ToolDefinition>, StoreError> {
        let inner = self.inner.read();
        let cutoff = self.now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let live: HashSet<Uuid> = inner
            .instances
            .values()
            .filter(|i| i.last_heartbeat_at >= cutoff)
            .map(|i| i.id)
            .collect();
        let mut names: Vec<&String> = inner
            .instance_tools
            .iter()
            .filter(|(instance_id, _)| live.contains(instance_id))
            .map(|(_, name)| name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .filter_map(|name| inner.tools.get(name).cloned())
            .collect())
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn subscribe(&self, channel: NotifyChannel) -> tokio::sync::broadcast::Receiver<Notification> {
        self.hub.subscribe(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded_run(store: &MemoryStore) -> (Session, Run) {
        let session = store
            .create_session(NewSession::new("test", Uuid::now_v7().to_string()))
            .await
            .unwrap();
        let run = store
            .create_run(NewRun::new(session.id, "chat", "hello"))
            .await
            .unwrap();
        (session, run)
    }

    fn exec_params(run: &Run, iteration: &Iteration, tool_use_id: &str) -> NewToolExecution {
        NewToolExecution {
            run_id: run.id,
            iteration_id: iteration.id,
            tool_use_id: tool_use_id.to_string(),
            tool_name: "calc".to_string(),
            tool_input: json!({"expr": "2+2"}),
            is_agent_tool: false,
            agent_name: None,
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn claim_runs_is_exclusive_across_tasks() {
        let store = Arc::new(MemoryStore::new());
        let session = store
            .create_session(NewSession::new("test", "claims"))
            .await
            .unwrap();
        for i in 0..20 {
            store
                .create_run(NewRun::new(session.id, "chat", format!("prompt {i}")))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claimed = store.claim_runs(Uuid::now_v7(), 3, None).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed.into_iter().map(|r| r.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "run {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn claim_runs_fifo_order() {
        let store = MemoryStore::new();
        let session = store
            .create_session(NewSession::new("test", "fifo"))
            .await
            .unwrap();
        let first = store
            .create_run(NewRun::new(session.id, "chat", "first"))
            .await
            .unwrap();
        let second = store
            .create_run(NewRun::new(session.id, "chat", "second"))
            .await
            .unwrap();

        let claimed = store.claim_runs(Uuid::now_v7(), 1, None).await.unwrap();
        assert_eq!(claimed[0].id, first.id);
        let claimed = store.claim_runs(Uuid::now_v7(), 1, None).await.unwrap();
        assert_eq!(claimed[0].id, second.id);
    }

    #[tokio::test]
    async fn fan_in_continues_run_after_last_tool() {
        let store = MemoryStore::new();
        let (session, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();

        let claimed = store.claim_runs(instance_id, 1, None).await.unwrap();
        assert_eq!(claimed[0].state, RunState::PendingApi);

        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        let executions = store
            .create_tool_executions_and_update_run_state(
                vec![
                    exec_params(&run, &iteration, "toolu_a"),
                    exec_params(&run, &iteration, "toolu_b"),
                ],
                run.id,
                RunState::PendingTools,
                RunUpdates {
                    increment_tool_iterations: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let claimed = store
            .claim_tool_executions(instance_id, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);

        store
            .complete_tool_execution(executions[0].id, "4")
            .await
            .unwrap();
        // One execution still running: run stays pending_tools
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::PendingTools
        );

        store
            .complete_tool_execution(executions[1].id, "6")
            .await
            .unwrap();
        let continued = store.get_run(run.id).await.unwrap();
        assert_eq!(continued.state, RunState::PendingApi);
        assert!(continued.claimed_by_instance_id.is_none());

        // Tool results aggregated into one assistant message, block order
        // matching the original tool_use order
        let messages = store.list_run_messages(run.id).await.unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.session_id, session.id);
        match (&last.content[0], &last.content[1]) {
            (
                ContentBlock::ToolResult { tool_use_id: a, content: ca, .. },
                ContentBlock::ToolResult { tool_use_id: b, content: cb, .. },
            ) => {
                assert_eq!(a, "toolu_a");
                assert_eq!(ca, "4");
                assert_eq!(b, "toolu_b");
                assert_eq!(cb, "6");
            }
            other => panic!("unexpected blocks: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_tool_retries_until_budget_exhausted() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();
        store.claim_runs(instance_id, 1, None).await.unwrap();
        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        let executions = store
            .create_tool_executions_and_update_run_state(
                vec![exec_params(&run, &iteration, "toolu_a")],
                run.id,
                RunState::PendingTools,
                RunUpdates::default(),
            )
            .await
            .unwrap();
        let execution_id = executions[0].id;

        // First attempt fails -> retry scheduled
        store.claim_tool_executions(instance_id, 1).await.unwrap();
        let outcome = store
            .fail_tool_execution(execution_id, "boom", Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ToolFailureOutcome::WillRetry { next_attempt: 2, .. }
        ));
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::PendingTools
        );

        // Second attempt fails -> terminal, fan-in fires
        store.claim_tool_executions(instance_id, 1).await.unwrap();
        let outcome = store
            .fail_tool_execution(execution_id, "boom again", Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ToolFailureOutcome::Failed(_)));
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::PendingApi
        );
    }

    #[tokio::test]
    async fn snooze_refunds_the_attempt() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();
        store.claim_runs(instance_id, 1, None).await.unwrap();
        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        let executions = store
            .create_tool_executions_and_update_run_state(
                vec![exec_params(&run, &iteration, "toolu_a")],
                run.id,
                RunState::PendingTools,
                RunUpdates::default(),
            )
            .await
            .unwrap();

        store.claim_tool_executions(instance_id, 1).await.unwrap();
        let snoozed = store
            .snooze_tool_execution(executions[0].id, Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(snoozed.state, ToolExecutionState::Pending);
        assert_eq!(snoozed.attempt_count, 0);
        assert_eq!(snoozed.snooze_count, 1);

        // Not claimable until the snooze deadline passes
        let claimed = store.claim_tool_executions(instance_id, 1).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn cancel_skips_tools() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();
        store.claim_runs(instance_id, 1, None).await.unwrap();
        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        let executions = store
            .create_tool_executions_and_update_run_state(
                vec![
                    exec_params(&run, &iteration, "toolu_a"),
                    exec_params(&run, &iteration, "toolu_b"),
                ],
                run.id,
                RunState::PendingTools,
                RunUpdates::default(),
            )
            .await
            .unwrap();
        // One claimed, one still pending
        store.claim_tool_executions(instance_id, 1).await.unwrap();

        let cancelled = store.cancel_run(run.id).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert_eq!(cancelled.error_type, Some(ErrorType::Cancelled));
        assert!(cancelled.finalized_at.is_some());

        for execution in executions {
            let state = store
                .get_tool_execution(execution.id)
                .await
                .unwrap()
                .state;
            assert_eq!(state, ToolExecutionState::Skipped);
        }
    }

    #[tokio::test]
    async fn rescue_resets_claim_and_counts() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        store.claim_runs(Uuid::now_v7(), 1, None).await.unwrap();

        let rescued = store.rescue_run(run.id).await.unwrap();
        assert_eq!(rescued.state, RunState::Pending);
        assert_eq!(rescued.rescue_attempts, 1);
        assert!(rescued.claimed_by_instance_id.is_none());
        assert!(rescued.last_rescue_at.is_some());

        // Terminal runs cannot be rescued
        store
            .update_run_state(
                run.id,
                RunState::Cancelled,
                RunUpdates::default(),
            )
            .await
            .unwrap();
        assert!(store.rescue_run(run.id).await.is_err());
    }

    #[tokio::test]
    async fn leader_lease_is_exclusive() {
        let store = MemoryStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let ttl = Duration::from_secs(30);

        assert!(store.leader_attempt_elect(a, ttl).await.unwrap());
        assert!(!store.leader_attempt_elect(b, ttl).await.unwrap());
        assert!(store.leader_attempt_reelect(a, ttl).await.unwrap());
        assert!(!store.leader_attempt_reelect(b, ttl).await.unwrap());

        store.leader_resign(a).await.unwrap();
        assert!(store.get_leader().await.unwrap().is_none());
        assert!(store.leader_attempt_elect(b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn iteration_numbers_are_dense() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        for expected in 0..4 {
            let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
            assert_eq!(iteration.iteration_number, expected);
            assert_eq!(
                store.get_run(run.id).await.unwrap().current_iteration_id,
                Some(iteration.id)
            );
        }
    }

    #[tokio::test]
    async fn stuck_pending_tools_probe() {
        let store = MemoryStore::new();
        let (session, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();
        store.claim_runs(instance_id, 1, None).await.unwrap();
        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        store
            .create_tool_executions_and_update_run_state(
                vec![exec_params(&run, &iteration, "toolu_a")],
                run.id,
                RunState::PendingTools,
                RunUpdates::default(),
            )
            .await
            .unwrap();

        // Non-terminal execution present: not stuck
        assert!(store
            .get_stuck_pending_tools_runs(10)
            .await
            .unwrap()
            .is_empty());

        // Force the wedged shape: terminal execution but run still
        // pending_tools
        {
            let mut inner = store.inner.write();
            for execution in inner.executions.values_mut() {
                execution.state = ToolExecutionState::Completed;
                execution.tool_output = Some("4".into());
            }
        }
        let stuck = store.get_stuck_pending_tools_runs(10).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, run.id);

        // The recovery path continues the run
        let executions = store
            .list_iteration_tool_executions(iteration.id)
            .await
            .unwrap();
        let blocks = executions
            .iter()
            .map(|e| {
                ContentBlock::tool_result(
                    e.tool_use_id.clone(),
                    e.tool_output.clone().unwrap_or_default(),
                    e.is_error,
                )
            })
            .collect();
        store
            .complete_tools_and_continue_run(session.id, run.id, blocks)
            .await
            .unwrap();
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::PendingApi
        );
    }

    #[tokio::test]
    async fn deregister_releases_claims_except_agent_tools() {
        let store = MemoryStore::new();
        let (_, run) = seeded_run(&store).await;
        let instance_id = Uuid::now_v7();
        store
            .register_instance(NewInstance::new(instance_id, 10, 50))
            .await
            .unwrap();
        store.claim_runs(instance_id, 1, None).await.unwrap();
        let iteration = store.create_iteration(run.id, true, vec![]).await.unwrap();
        let mut agent_param = exec_params(&run, &iteration, "toolu_agent");
        agent_param.is_agent_tool = true;
        agent_param.agent_name = Some("inner".into());
        let executions = store
            .create_tool_executions_and_update_run_state(
                vec![exec_params(&run, &iteration, "toolu_a"), agent_param],
                run.id,
                RunState::PendingTools,
                RunUpdates::default(),
            )
            .await
            .unwrap();
        store.claim_tool_executions(instance_id, 10).await.unwrap();
        // Agent-tool execution waits on its child run
        store
            .set_tool_execution_child_run(executions[1].id, Uuid::now_v7())
            .await
            .unwrap();

        store.deregister_instance(instance_id).await.unwrap();

        let released = store.get_tool_execution(executions[0].id).await.unwrap();
        assert_eq!(released.state, ToolExecutionState::Pending);
        let waiting = store.get_tool_execution(executions[1].id).await.unwrap();
        assert_eq!(waiting.state, ToolExecutionState::Running);
        assert!(store.list_instances().await.unwrap().is_empty());
    }
}
