//! PostgreSQL implementation of the Store trait
//!
//! Production persistence using PostgreSQL with:
//! - Claim paths built on CTE + FOR UPDATE SKIP LOCKED
//! - Database-owned fan-in and child-run completion (see migrations)
//! - LISTEN/NOTIFY pumped into broadcast channels as wake-up hints
//!
//! All lease and staleness math uses NOW() on the server; client clocks are
//! never consulted.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use agentpg_core::{
    AgentDefinition, BatchStatus, CompactionEvent, ContentBlock, ErrorType, Instance, Iteration,
    IterationResult, Leader, Message, MessageRole, NewInstance, NewMessage, NewRun, NewSession,
    NewToolExecution, Run, RunMode, RunState, RunUpdates, Session, StopReason, ToolDefinition,
    ToolExecution, ToolExecutionState, LEADER_NAME,
};

use crate::notify::{Notification, NotifyChannel};
use crate::store::{NewCompactionEvent, Store, StoreError, ToolFailureOutcome};
use crate::NotifyHub;

/// PostgreSQL implementation of the Store trait
///
/// # Example
///
/// ```ignore
/// use agentpg_storage::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/agentpg").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// store.start_listener().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    hub: NotifyHub,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hub: NotifyHub::new(),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Start the LISTEN/NOTIFY pump feeding [`Store::subscribe`] receivers.
    ///
    /// Notifications are hints; a pump failure degrades to poll-only
    /// operation, it never wedges progress.
    pub async fn start_listener(&self) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        listener
            .listen_all([
                NotifyChannel::RunState.pg_channel(),
                NotifyChannel::ToolPending.pg_channel(),
                NotifyChannel::IterationPoll.pg_channel(),
            ])
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let hub = self.hub.clone();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(event) => match serde_json::from_str::<Notification>(event.payload()) {
                        Ok(notification) => hub.publish(notification),
                        Err(e) => {
                            warn!(channel = event.channel(), "Unparseable notification: {}", e)
                        }
                    },
                    Err(e) => {
                        // The listener reconnects internally; log and keep going
                        error!("Notification listener error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(())
    }
}

// Row mapping helpers

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_metadata(value: serde_json::Value) -> Result<HashMap<String, String>, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn metadata_json(metadata: &HashMap<String, String>) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(metadata).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_run_state(s: &str) -> Result<RunState, StoreError> {
    s.parse().map_err(StoreError::Database)
}

fn parse_tool_state(s: &str) -> Result<ToolExecutionState, StoreError> {
    s.parse().map_err(StoreError::Database)
}

fn usage_from_row(row: &PgRow) -> Option<agentpg_core::TokenUsage> {
    let input: Option<i64> = row.get("input_tokens");
    let output: Option<i64> = row.get("output_tokens");
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(agentpg_core::TokenUsage::new(
            i.unwrap_or(0),
            o.unwrap_or(0),
        )),
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.get("id"),
        tenant: row.get("tenant"),
        identifier: row.get("identifier"),
        parent_session_id: row.get("parent_session_id"),
        depth: row.get("depth"),
        metadata: parse_metadata(row.get("metadata"))?,
        compaction_count: row.get("compaction_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let role: String = row.get("role");
    let content: serde_json::Value = row.get("content");
    Ok(Message {
        id: row.get("id"),
        session_id: row.get("session_id"),
        run_id: row.get("run_id"),
        role: role.parse::<MessageRole>().map_err(StoreError::Database)?,
        content: serde_json::from_value(content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        usage: usage_from_row(row),
        preserved: row.get("preserved"),
        summary: row.get("summary"),
        created_at: row.get("created_at"),
    })
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let state: String = row.get("state");
    let previous_state: Option<String> = row.get("previous_state");
    let run_mode: String = row.get("run_mode");
    let error_type: Option<String> = row.get("error_type");
    Ok(Run {
        id: row.get("id"),
        session_id: row.get("session_id"),
        agent_name: row.get("agent_name"),
        prompt: row.get("prompt"),
        run_mode: run_mode.parse::<RunMode>().map_err(StoreError::Database)?,
        parent_run_id: row.get("parent_run_id"),
        parent_tool_execution_id: row.get("parent_tool_execution_id"),
        depth: row.get("depth"),
        state: parse_run_state(&state)?,
        previous_state: previous_state.as_deref().map(parse_run_state).transpose()?,
        current_iteration_id: row.get("current_iteration_id"),
        tool_iterations: row.get("tool_iterations"),
        usage: agentpg_core::TokenUsage::new(row.get("input_tokens"), row.get("output_tokens")),
        error_message: row.get("error_message"),
        error_type: error_type
            .as_deref()
            .map(|s| s.parse::<ErrorType>().map_err(StoreError::Database))
            .transpose()?,
        created_by_instance_id: row.get("created_by_instance_id"),
        claimed_by_instance_id: row.get("claimed_by_instance_id"),
        claimed_at: row.get("claimed_at"),
        rescue_attempts: row.get("rescue_attempts"),
        last_rescue_at: row.get("last_rescue_at"),
        scheduled_at: row.get("scheduled_at"),
        started_at: row.get("started_at"),
        finalized_at: row.get("finalized_at"),
        metadata: parse_metadata(row.get("metadata"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn iteration_from_row(row: &PgRow) -> Result<Iteration, StoreError> {
    let batch_status: Option<String> = row.get("batch_status");
    let stop_reason: Option<String> = row.get("stop_reason");
    let error_type: Option<String> = row.get("error_type");
    let request_ids: serde_json::Value = row.get("request_message_ids");
    Ok(Iteration {
        id: row.get("id"),
        run_id: row.get("run_id"),
        iteration_number: row.get("iteration_number"),
        is_streaming: row.get("is_streaming"),
        batch_id: row.get("batch_id"),
        batch_status: batch_status
            .as_deref()
            .map(|s| s.parse::<BatchStatus>().map_err(StoreError::Database))
            .transpose()?,
        batch_submitted_at: row.get("batch_submitted_at"),
        batch_completed_at: row.get("batch_completed_at"),
        batch_expires_at: row.get("batch_expires_at"),
        poll_count: row.get("poll_count"),
        request_message_ids: serde_json::from_value(request_ids)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        response_message_id: row.get("response_message_id"),
        stop_reason: stop_reason.as_deref().map(StopReason::from),
        has_tool_use: row.get("has_tool_use"),
        tool_execution_count: row.get("tool_execution_count"),
        usage: usage_from_row(row),
        error_message: row.get("error_message"),
        error_type: error_type
            .as_deref()
            .map(|s| s.parse::<ErrorType>().map_err(StoreError::Database))
            .transpose()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn tool_execution_from_row(row: &PgRow) -> Result<ToolExecution, StoreError> {
    let state: String = row.get("state");
    Ok(ToolExecution {
        id: row.get("id"),
        run_id: row.get("run_id"),
        iteration_id: row.get("iteration_id"),
        state: parse_tool_state(&state)?,
        tool_use_id: row.get("tool_use_id"),
        tool_name: row.get("tool_name"),
        tool_input: row.get("tool_input"),
        is_agent_tool: row.get("is_agent_tool"),
        agent_name: row.get("agent_name"),
        child_run_id: row.get("child_run_id"),
        tool_output: row.get("tool_output"),
        is_error: row.get("is_error"),
        error_message: row.get("error_message"),
        claimed_by_instance_id: row.get("claimed_by_instance_id"),
        claimed_at: row.get("claimed_at"),
        attempt_count: row.get("attempt_count"),
        max_attempts: row.get("max_attempts"),
        scheduled_at: row.get("scheduled_at"),
        snooze_count: row.get("snooze_count"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn instance_from_row(row: &PgRow) -> Result<Instance, StoreError> {
    Ok(Instance {
        id: row.get("id"),
        name: row.get("name"),
        hostname: row.get("hostname"),
        pid: row.get("pid"),
        version: row.get("version"),
        max_concurrent_runs: row.get("max_concurrent_runs"),
        max_concurrent_tools: row.get("max_concurrent_tools"),
        metadata: parse_metadata(row.get("metadata"))?,
        created_at: row.get("created_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
    })
}

const TERMINAL_RUN_STATES: &str = "('completed', 'cancelled', 'failed')";
const TERMINAL_TOOL_STATES: &str = "('completed', 'failed', 'skipped')";

#[async_trait]
impl Store for PostgresStore {
    // =========================================================================
    // Sessions
    // =========================================================================

    #[instrument(skip(self, new))]
    async fn create_session(&self, new: NewSession) -> Result<Session, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_sessions (id, tenant, identifier, parent_session_id, depth, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.tenant)
        .bind(&new.identifier)
        .bind(new.parent_session_id)
        .bind(new.depth)
        .bind(metadata_json(&new.metadata)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                StoreError::Precondition(format!(
                    "session already exists for tenant '{}' identifier '{}'",
                    new.tenant, new.identifier
                ))
            } else {
                db_err(e)
            }
        })?;

        let session = session_from_row(&row)?;
        debug!(session_id = %session.id, "created session");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn get_session(&self, id: Uuid) -> Result<Session, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("session", id))?;
        session_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_session(
        &self,
        tenant: &str,
        identifier: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_sessions WHERE tenant = $1 AND identifier = $2")
            .bind(tenant)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn touch_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE agentpg_sessions SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_session_compaction(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agentpg_sessions
            SET compaction_count = compaction_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn record_compaction_event(
        &self,
        event: NewCompactionEvent,
    ) -> Result<CompactionEvent, StoreError> {
        let preserved = serde_json::to_value(&event.preserved_message_ids)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_compaction_events
                (id, session_id, preserved_message_ids, summary_message_id, strategy, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event.session_id)
        .bind(preserved)
        .bind(event.summary_message_id)
        .bind(&event.strategy)
        .bind(event.duration_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let ids: serde_json::Value = row.get("preserved_message_ids");
        Ok(CompactionEvent {
            id: row.get("id"),
            session_id: row.get("session_id"),
            preserved_message_ids: serde_json::from_value(ids)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            summary_message_id: row.get("summary_message_id"),
            strategy: row.get("strategy"),
            duration_ms: row.get("duration_ms"),
            created_at: row.get("created_at"),
        })
    }

    // =========================================================================
    // Messages
    // =========================================================================

    #[instrument(skip(self, new))]
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let content = serde_json::to_value(&new.content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_messages
                (id, session_id, run_id, role, content, input_tokens, output_tokens, preserved, summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(new.session_id)
        .bind(new.run_id)
        .bind(new.role.to_string())
        .bind(content)
        .bind(new.usage.map(|u| u.input_tokens))
        .bind(new.usage.map(|u| u.output_tokens))
        .bind(new.preserved)
        .bind(new.summary)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        message_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_message(&self, id: Uuid) -> Result<Message, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("message", id))?;
        message_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_root_context(&self, session_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.* FROM agentpg_messages m
            LEFT JOIN agentpg_runs r ON m.run_id = r.id
            WHERE m.session_id = $1
              AND m.archived_at IS NULL
              AND (m.run_id IS NULL OR r.depth = 0)
            ORDER BY m.created_at, m.id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_run_messages(&self, run_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM agentpg_messages
            WHERE run_id = $1 AND archived_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn session_token_count(&self, session_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(COALESCE(input_tokens, 0) + COALESCE(output_tokens, 0)), 0) AS total
            FROM agentpg_messages
            WHERE session_id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get::<i64, _>("total"))
    }

    #[instrument(skip(self, message_ids))]
    async fn archive_messages(&self, message_ids: &[Uuid]) -> Result<(), StoreError> {
        sqlx::query("UPDATE agentpg_messages SET archived_at = NOW() WHERE id = ANY($1)")
            .bind(message_ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        debug!(count = message_ids.len(), "archived messages");
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    #[instrument(skip(self, new))]
    async fn create_run(&self, new: NewRun) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_runs
                (id, session_id, agent_name, prompt, run_mode, parent_run_id,
                 parent_tool_execution_id, depth, created_by_instance_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(new.session_id)
        .bind(&new.agent_name)
        .bind(&new.prompt)
        .bind(new.run_mode.to_string())
        .bind(new.parent_run_id)
        .bind(new.parent_tool_execution_id)
        .bind(new.depth)
        .bind(new.created_by_instance_id)
        .bind(metadata_json(&new.metadata)?)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let run = run_from_row(&row)?;

        // The prompt enters the conversation with the run, atomically
        let content = serde_json::to_value(vec![ContentBlock::text(&new.prompt)])
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO agentpg_messages (id, session_id, run_id, role, content)
            VALUES ($1, $2, $3, 'user', $4)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(new.session_id)
        .bind(run.id)
        .bind(content)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(run_id = %run.id, agent = %run.agent_name, "created run");
        Ok(run)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", id))?;
        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn claim_runs(
        &self,
        instance_id: Uuid,
        max_count: usize,
        run_mode: Option<RunMode>,
    ) -> Result<Vec<Run>, StoreError> {
        if max_count == 0 {
            return Ok(vec![]);
        }

        // Claimable: queued states, plus pending_api rows whose claim was
        // released (tool fan-in and rescue both leave runs that way)
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM agentpg_runs
                WHERE scheduled_at <= NOW()
                  AND (
                        state IN ('pending', 'awaiting_continuation')
                     OR (state = 'pending_api' AND claimed_by_instance_id IS NULL)
                  )
                  AND ($3::text IS NULL OR run_mode = $3)
                ORDER BY scheduled_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agentpg_runs r
            SET state = 'pending_api',
                previous_state = CASE WHEN r.state = 'pending_api' THEN r.previous_state ELSE r.state END,
                claimed_by_instance_id = $1,
                claimed_at = NOW(),
                started_at = COALESCE(r.started_at, NOW()),
                updated_at = NOW()
            FROM claimable c
            WHERE r.id = c.id
            RETURNING r.*
            "#,
        )
        .bind(instance_id)
        .bind(max_count as i64)
        .bind(run_mode.map(|m| m.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let runs: Vec<Run> = rows.iter().map(run_from_row).collect::<Result<_, _>>()?;
        if !runs.is_empty() {
            debug!(%instance_id, count = runs.len(), "claimed runs");
        }
        Ok(runs)
    }

    #[instrument(skip(self, updates))]
    async fn update_run_state(
        &self,
        run_id: Uuid,
        to: RunState,
        updates: RunUpdates,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        let run = run_from_row(&row)?;

        if !run.state.can_transition_to(to) {
            return Err(StoreError::invalid_transition("run", run_id, run.state, to));
        }

        let usage = updates.usage_delta.unwrap_or_default();
        let row = sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET state = $2,
                previous_state = $3,
                current_iteration_id = COALESCE($4, current_iteration_id),
                error_message = COALESCE($5, error_message),
                error_type = COALESCE($6, error_type),
                input_tokens = input_tokens + $7,
                output_tokens = output_tokens + $8,
                tool_iterations = tool_iterations + $9,
                claimed_by_instance_id = CASE WHEN $2 = 'pending_api' THEN claimed_by_instance_id ELSE NULL END,
                claimed_at = CASE WHEN $2 = 'pending_api' THEN claimed_at ELSE NULL END,
                finalized_at = CASE WHEN $2 IN ('completed', 'cancelled', 'failed') THEN NOW() ELSE finalized_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(to.to_string())
        .bind(run.state.to_string())
        .bind(updates.current_iteration_id)
        .bind(updates.error_message.as_deref())
        .bind(updates.error_type.map(|t| t.to_string()))
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(if updates.increment_tool_iterations { 1i32 } else { 0 })
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let updated = run_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, from = %run.state, to = %to, "run state transition");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn cancel_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        let run = run_from_row(&row)?;

        if !run.state.can_transition_to(RunState::Cancelled) {
            return Err(StoreError::invalid_transition(
                "run",
                run_id,
                run.state,
                RunState::Cancelled,
            ));
        }

        let row = sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET state = 'cancelled',
                previous_state = $2,
                error_type = 'cancelled',
                error_message = COALESCE(error_message, 'run cancelled'),
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                finalized_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(run.state.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let cancelled = run_from_row(&row)?;

        sqlx::query(
            r#"
            UPDATE agentpg_tool_executions
            SET state = 'skipped',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE run_id = $1 AND state IN ('pending', 'running')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, "cancelled run");
        Ok(cancelled)
    }

    #[instrument(skip(self))]
    async fn get_stuck_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM agentpg_runs
            WHERE claimed_by_instance_id IS NOT NULL
              AND claimed_at < NOW() - make_interval(secs => $1)
              AND state NOT IN {TERMINAL_RUN_STATES}
              AND rescue_attempts < $2
            ORDER BY claimed_at
            LIMIT $3
            "#
        ))
        .bind(timeout.as_secs_f64())
        .bind(max_rescue_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_rescue_exhausted_runs(
        &self,
        timeout: Duration,
        max_rescue_attempts: i32,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM agentpg_runs
            WHERE claimed_by_instance_id IS NOT NULL
              AND claimed_at < NOW() - make_interval(secs => $1)
              AND state NOT IN {TERMINAL_RUN_STATES}
              AND rescue_attempts >= $2
            ORDER BY claimed_at
            LIMIT $3
            "#
        ))
        .bind(timeout.as_secs_f64())
        .bind(max_rescue_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn rescue_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        let run = run_from_row(&row)?;

        if !run.state.can_transition_to(RunState::Pending) {
            return Err(StoreError::invalid_transition(
                "run",
                run_id,
                run.state,
                RunState::Pending,
            ));
        }

        let row = sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET state = 'pending',
                previous_state = $2,
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                rescue_attempts = rescue_attempts + 1,
                last_rescue_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(run.state.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let rescued = run_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, rescue_attempts = rescued.rescue_attempts, "rescued run");
        Ok(rescued)
    }

    #[instrument(skip(self))]
    async fn get_stuck_pending_tools_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT r.* FROM agentpg_runs r
            WHERE r.state = 'pending_tools'
              AND NOT EXISTS (
                  SELECT 1 FROM agentpg_tool_executions te
                  WHERE te.iteration_id = r.current_iteration_id
                    AND te.state NOT IN {TERMINAL_TOOL_STATES}
              )
            ORDER BY r.updated_at
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    // =========================================================================
    // Iterations
    // =========================================================================

    #[instrument(skip(self, request_message_ids))]
    async fn create_iteration(
        &self,
        run_id: Uuid,
        is_streaming: bool,
        request_message_ids: Vec<Uuid>,
    ) -> Result<Iteration, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Lock the run row to serialize iteration numbering
        let run_row = sqlx::query("SELECT id FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if run_row.is_none() {
            return Err(StoreError::not_found("run", run_id));
        }

        let request_ids = serde_json::to_value(&request_message_ids)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_iterations (id, run_id, iteration_number, is_streaming, request_message_ids)
            SELECT $1, $2,
                   COALESCE(MAX(iteration_number) + 1, 0),
                   $3, $4
            FROM agentpg_iterations
            WHERE run_id = $2
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(run_id)
        .bind(is_streaming)
        .bind(request_ids)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let iteration = iteration_from_row(&row)?;

        sqlx::query(
            "UPDATE agentpg_runs SET current_iteration_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(run_id)
        .bind(iteration.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, iteration = iteration.iteration_number, "opened iteration");
        Ok(iteration)
    }

    #[instrument(skip(self, result))]
    async fn complete_iteration(
        &self,
        iteration_id: Uuid,
        result: IterationResult,
    ) -> Result<Iteration, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE agentpg_iterations
            SET response_message_id = $2,
                stop_reason = $3,
                has_tool_use = $4,
                tool_execution_count = $5,
                input_tokens = $6,
                output_tokens = $7,
                completed_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(iteration_id)
        .bind(result.response_message_id)
        .bind(result.stop_reason.to_string())
        .bind(result.has_tool_use)
        .bind(result.tool_execution_count)
        .bind(result.usage.input_tokens)
        .bind(result.usage.output_tokens)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::not_found("iteration", iteration_id))?;
        iteration_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn record_iteration_error(
        &self,
        iteration_id: Uuid,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agentpg_iterations
            SET error_message = $2, error_type = $3, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(iteration_id)
        .bind(message)
        .bind(error_type.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_iteration(&self, id: Uuid) -> Result<Iteration, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_iterations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("iteration", id))?;
        iteration_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn record_batch_submitted(
        &self,
        iteration_id: Uuid,
        batch_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agentpg_iterations
            SET batch_id = $2,
                batch_status = 'submitted',
                batch_submitted_at = NOW(),
                batch_expires_at = $3
            WHERE id = $1
            "#,
        )
        .bind(iteration_id)
        .bind(batch_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_batch_poll(
        &self,
        iteration_id: Uuid,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agentpg_iterations
            SET batch_status = $2,
                poll_count = poll_count + 1,
                batch_completed_at = CASE WHEN $2 = 'ended' THEN NOW() ELSE batch_completed_at END
            WHERE id = $1
            "#,
        )
        .bind(iteration_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // =========================================================================
    // Tool executions
    // =========================================================================

    #[instrument(skip(self, params, updates))]
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

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        let run = run_from_row(&row)?;

        if !run.state.can_transition_to(target_state) {
            return Err(StoreError::invalid_transition(
                "run",
                run_id,
                run.state,
                target_state,
            ));
        }

        let mut executions = Vec::with_capacity(params.len());
        for param in &params {
            // Ids are generated in block order; fan-in relies on it
            let row = sqlx::query(
                r#"
                INSERT INTO agentpg_tool_executions
                    (id, run_id, iteration_id, tool_use_id, tool_name, tool_input,
                     is_agent_tool, agent_name, max_attempts)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(param.run_id)
            .bind(param.iteration_id)
            .bind(&param.tool_use_id)
            .bind(&param.tool_name)
            .bind(&param.tool_input)
            .bind(param.is_agent_tool)
            .bind(param.agent_name.as_deref())
            .bind(param.max_attempts)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            executions.push(tool_execution_from_row(&row)?);
        }

        let usage = updates.usage_delta.unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET state = $2,
                previous_state = $3,
                current_iteration_id = COALESCE($4, current_iteration_id),
                input_tokens = input_tokens + $5,
                output_tokens = output_tokens + $6,
                tool_iterations = tool_iterations + $7,
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(target_state.to_string())
        .bind(run.state.to_string())
        .bind(updates.current_iteration_id)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(if updates.increment_tool_iterations { 1i32 } else { 0 })
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, count = executions.len(), to = %target_state, "created tool executions");
        Ok(executions)
    }

    #[instrument(skip(self))]
    async fn claim_tool_executions(
        &self,
        instance_id: Uuid,
        max_count: usize,
    ) -> Result<Vec<ToolExecution>, StoreError> {
        if max_count == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM agentpg_tool_executions
                WHERE state = 'pending'
                  AND scheduled_at <= NOW()
                ORDER BY scheduled_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agentpg_tool_executions t
            SET state = 'running',
                claimed_by_instance_id = $1,
                claimed_at = NOW(),
                attempt_count = attempt_count + 1,
                updated_at = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .bind(instance_id)
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let executions: Vec<ToolExecution> = rows
            .iter()
            .map(tool_execution_from_row)
            .collect::<Result<_, _>>()?;
        if !executions.is_empty() {
            debug!(%instance_id, count = executions.len(), "claimed tool executions");
        }
        Ok(executions)
    }

    #[instrument(skip(self))]
    async fn get_tool_execution(&self, id: Uuid) -> Result<ToolExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM agentpg_tool_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        tool_execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_iteration_tool_executions(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<ToolExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM agentpg_tool_executions
            WHERE iteration_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(iteration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(tool_execution_from_row).collect()
    }

    #[instrument(skip(self, output))]
    async fn complete_tool_execution(
        &self,
        id: Uuid,
        output: &str,
    ) -> Result<ToolExecution, StoreError> {
        // Fan-in runs inside the state-change trigger, in this statement's
        // transaction
        let row = sqlx::query(
            r#"
            UPDATE agentpg_tool_executions
            SET state = 'completed',
                tool_output = $2,
                is_error = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(output)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                debug!(execution_id = %id, "completed tool execution");
                tool_execution_from_row(&row)
            }
            None => {
                let current = self.get_tool_execution(id).await?;
                Err(StoreError::invalid_transition(
                    "tool execution",
                    id,
                    current.state,
                    ToolExecutionState::Completed,
                ))
            }
        }
    }

    #[instrument(skip(self, error))]
    async fn fail_tool_execution(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<ToolFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_tool_executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("tool execution", id))?;
        let execution = tool_execution_from_row(&row)?;

        if execution.state != ToolExecutionState::Running {
            return Err(StoreError::invalid_transition(
                "tool execution",
                id,
                execution.state,
                ToolExecutionState::Failed,
            ));
        }

        let outcome = if execution.attempt_count < execution.max_attempts {
            let row = sqlx::query(
                r#"
                UPDATE agentpg_tool_executions
                SET state = 'pending',
                    claimed_by_instance_id = NULL,
                    claimed_at = NULL,
                    last_error = $2,
                    scheduled_at = $3,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(retry_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let updated = tool_execution_from_row(&row)?;
            debug!(execution_id = %id, next_attempt = updated.attempt_count + 1, "tool execution will retry");
            ToolFailureOutcome::WillRetry {
                next_attempt: updated.attempt_count + 1,
                scheduled_at: updated.scheduled_at,
            }
        } else {
            let row = sqlx::query(
                r#"
                UPDATE agentpg_tool_executions
                SET state = 'failed',
                    is_error = TRUE,
                    error_message = $2,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let failed = tool_execution_from_row(&row)?;
            debug!(execution_id = %id, "tool execution failed terminally");
            ToolFailureOutcome::Failed(failed)
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn snooze_tool_execution(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<ToolExecution, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE agentpg_tool_executions
            SET state = 'pending',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                attempt_count = GREATEST(attempt_count - 1, 0),
                snooze_count = snooze_count + 1,
                scheduled_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(until)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                debug!(execution_id = %id, until = %until, "snoozed tool execution");
                tool_execution_from_row(&row)
            }
            None => {
                let current = self.get_tool_execution(id).await?;
                Err(StoreError::invalid_transition(
                    "tool execution",
                    id,
                    current.state,
                    ToolExecutionState::Pending,
                ))
            }
        }
    }

    #[instrument(skip(self))]
    async fn set_tool_execution_child_run(
        &self,
        id: Uuid,
        child_run_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agentpg_tool_executions
            SET child_run_id = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(child_run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Precondition(format!(
                "tool execution {} is not running",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, blocks))]
    async fn complete_tools_and_continue_run(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agentpg_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        let run = run_from_row(&row)?;

        if run.session_id != session_id {
            return Err(StoreError::Precondition(format!(
                "run {} does not belong to session {}",
                run_id, session_id
            )));
        }
        if run.state != RunState::PendingTools {
            return Err(StoreError::invalid_transition(
                "run",
                run_id,
                run.state,
                RunState::PendingApi,
            ));
        }

        let remaining: i64 = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS remaining FROM agentpg_tool_executions
            WHERE iteration_id = $1 AND state NOT IN {TERMINAL_TOOL_STATES}
            "#
        ))
        .bind(run.current_iteration_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("remaining");
        if remaining > 0 {
            return Err(StoreError::Precondition(format!(
                "{} tool executions still non-terminal for run {}",
                remaining, run_id
            )));
        }

        let content =
            serde_json::to_value(&blocks).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_messages (id, session_id, run_id, role, content)
            VALUES ($1, $2, $3, 'assistant', $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(session_id)
        .bind(run_id)
        .bind(content)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let message = message_from_row(&row)?;

        sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET state = 'pending_api',
                previous_state = 'pending_tools',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%run_id, "tools complete, run continued");
        Ok(message)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    #[instrument(skip(self, new))]
    async fn register_instance(&self, new: NewInstance) -> Result<Instance, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO agentpg_instances
                (id, name, hostname, pid, version, max_concurrent_runs, max_concurrent_tools, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                hostname = EXCLUDED.hostname,
                pid = EXCLUDED.pid,
                version = EXCLUDED.version,
                max_concurrent_runs = EXCLUDED.max_concurrent_runs,
                max_concurrent_tools = EXCLUDED.max_concurrent_tools,
                metadata = EXCLUDED.metadata,
                last_heartbeat_at = NOW()
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.name.as_deref())
        .bind(new.hostname.as_deref())
        .bind(new.pid)
        .bind(new.version.as_deref())
        .bind(new.max_concurrent_runs)
        .bind(new.max_concurrent_tools)
        .bind(metadata_json(&new.metadata)?)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let instance = instance_from_row(&row)?;
        debug!(instance_id = %instance.id, "registered instance");
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn heartbeat_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agentpg_instances SET last_heartbeat_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("instance", id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Release claimed runs; they stay claimable for the rest of the fleet
        sqlx::query(
            r#"
            UPDATE agentpg_runs
            SET claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE claimed_by_instance_id = $1
              AND state = 'pending_api'
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Release claimed tool executions, except agent-tool rows waiting on
        // a child run (re-dispatching those would spawn a second child)
        sqlx::query(
            r#"
            UPDATE agentpg_tool_executions
            SET state = 'pending',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE claimed_by_instance_id = $1
              AND state = 'running'
              AND child_run_id IS NULL
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM agentpg_instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(instance_id = %id, "deregistered instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agentpg_instances ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_stale_instances(&self, ttl: Duration) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM agentpg_instances
            WHERE last_heartbeat_at < NOW() - make_interval(secs => $1)
            ORDER BY last_heartbeat_at
            "#,
        )
        .bind(ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(instance_from_row).collect()
    }

    // =========================================================================
    // Leader lease
    // =========================================================================

    #[instrument(skip(self))]
    async fn leader_attempt_elect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM agentpg_leader WHERE name = $1 AND expires_at <= NOW()")
            .bind(LEADER_NAME)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO agentpg_leader (name, leader_instance_id, elected_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(LEADER_NAME)
        .bind(instance_id)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let elected = result.rows_affected() == 1;
        if elected {
            debug!(%instance_id, "elected leader");
        }
        Ok(elected)
    }

    #[instrument(skip(self))]
    async fn leader_attempt_reelect(
        &self,
        instance_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agentpg_leader
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE name = $1 AND leader_instance_id = $2 AND expires_at > NOW()
            "#,
        )
        .bind(LEADER_NAME)
        .bind(instance_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn leader_resign(&self, instance_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM agentpg_leader WHERE name = $1 AND leader_instance_id = $2")
            .bind(LEADER_NAME)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        debug!(%instance_id, "resigned leadership");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn leader_delete_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM agentpg_leader WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_leader(&self) -> Result<Option<Leader>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM agentpg_leader WHERE name = $1 AND expires_at > NOW()",
        )
        .bind(LEADER_NAME)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| Leader {
            name: row.get("name"),
            leader_instance_id: row.get("leader_instance_id"),
            elected_at: row.get("elected_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    // =========================================================================
    // Agent / tool registry
    // =========================================================================

    #[instrument(skip(self, def), fields(agent = %def.name))]
    async fn upsert_agent(&self, def: &AgentDefinition) -> Result<(), StoreError> {
        let definition =
            serde_json::to_value(def).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO agentpg_agents (name, definition)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(&def.name)
        .bind(definition)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_agent(&self, name: &str) -> Result<Option<AgentDefinition>, StoreError> {
        let row = sqlx::query("SELECT definition FROM agentpg_agents WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| {
            let definition: serde_json::Value = row.get("definition");
            serde_json::from_value(definition).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn link_instance_agent(
        &self,
        instance_id: Uuid,
        agent_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agentpg_instance_agents (instance_id, agent_name)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(agent_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, def), fields(tool = %def.name))]
    async fn upsert_tool(&self, def: &ToolDefinition) -> Result<(), StoreError> {
        let definition =
            serde_json::to_value(def).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO agentpg_tools (name, definition)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(&def.name)
        .bind(definition)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn link_instance_tool(
        &self,
        instance_id: Uuid,
        tool_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agentpg_instance_tools (instance_id, tool_name)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(tool_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_fleet_tools(&self, ttl: Duration) -> Result<Vec<ToolDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT t.name, t.definition
            FROM agentpg_tools t
            JOIN agentpg_instance_tools it ON it.tool_name = t.name
            JOIN agentpg_instances i ON i.id = it.instance_id
            WHERE i.last_heartbeat_at > NOW() - make_interval(secs => $1)
            ORDER BY t.name
            "#,
        )
        .bind(ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let definition: serde_json::Value = row.get("definition");
                serde_json::from_value(definition)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
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
    // Integration tests require a PostgreSQL database.
    // Run with: cargo test -p agentpg-storage --test postgres_integration_test -- --test-threads=1
}
