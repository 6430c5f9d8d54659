// Run and iteration entities
//
// A run is one prompt-to-terminal cycle; an iteration is one LLM call within
// it. Invariants (enforced by storage):
//   - finalized_at is non-null iff the state is terminal
//   - claimed_by_instance_id is set exactly while a worker holds the run
//   - depth = parent.depth + 1 when a parent exists
//   - iteration numbers are dense, strictly increasing from 0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::message::TokenUsage;
use crate::state::{ErrorType, RunState, StopReason};

/// How iterations of this run call the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Submit-and-poll batch API
    Batch,
    /// Synchronous streaming API
    Streaming,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(Self::Batch),
            "streaming" => Ok(Self::Streaming),
            _ => Err(format!("unknown run mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_name: String,
    pub prompt: String,
    pub run_mode: RunMode,

    /// Agent-as-tool linkage
    pub parent_run_id: Option<Uuid>,
    pub parent_tool_execution_id: Option<Uuid>,
    pub depth: i32,

    pub state: RunState,
    pub previous_state: Option<RunState>,
    pub current_iteration_id: Option<Uuid>,

    /// Completed tool-use iterations so far
    pub tool_iterations: i32,

    pub usage: TokenUsage,

    pub error_message: Option<String>,
    pub error_type: Option<ErrorType>,

    pub created_by_instance_id: Option<Uuid>,
    pub claimed_by_instance_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,

    pub rescue_attempts: i32,
    pub last_rescue_at: Option<DateTime<Utc>>,

    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,

    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Input for creating a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: Uuid,
    pub agent_name: String,
    pub prompt: String,
    pub run_mode: RunMode,
    pub parent_run_id: Option<Uuid>,
    pub parent_tool_execution_id: Option<Uuid>,
    pub depth: i32,
    pub created_by_instance_id: Option<Uuid>,
    pub metadata: HashMap<String, String>,
}

impl NewRun {
    pub fn new(session_id: Uuid, agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            run_mode: RunMode::Streaming,
            parent_run_id: None,
            parent_tool_execution_id: None,
            depth: 0,
            created_by_instance_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = mode;
        self
    }

    /// Link this run as the child created for a tool execution of `parent`.
    pub fn as_child_of(mut self, parent_run: &Run, tool_execution_id: Uuid) -> Self {
        self.parent_run_id = Some(parent_run.id);
        self.parent_tool_execution_id = Some(tool_execution_id);
        self.depth = parent_run.depth + 1;
        self
    }
}

/// Fields a state transition may update alongside the state itself.
#[derive(Debug, Clone, Default)]
pub struct RunUpdates {
    pub current_iteration_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub error_type: Option<ErrorType>,
    pub usage_delta: Option<TokenUsage>,
    pub increment_tool_iterations: bool,
}

/// Status of a batch-mode iteration at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Submitted,
    InProgress,
    Ended,
    Expired,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Ended => write!(f, "ended"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "in_progress" => Ok(Self::InProgress),
            "ended" => Ok(Self::Ended),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown batch status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub run_id: Uuid,

    /// Dense, 0-based ordinal within the run
    pub iteration_number: i32,

    pub is_streaming: bool,

    // Batch-mode bookkeeping; null for streaming iterations
    pub batch_id: Option<String>,
    pub batch_status: Option<BatchStatus>,
    pub batch_submitted_at: Option<DateTime<Utc>>,
    pub batch_completed_at: Option<DateTime<Utc>>,
    pub batch_expires_at: Option<DateTime<Utc>>,
    pub poll_count: i32,

    pub request_message_ids: Vec<Uuid>,
    pub response_message_id: Option<Uuid>,

    pub stop_reason: Option<StopReason>,
    pub has_tool_use: bool,
    pub tool_execution_count: i32,

    pub usage: Option<TokenUsage>,

    pub error_message: Option<String>,
    pub error_type: Option<ErrorType>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of an iteration's LLM call, applied when closing the iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub response_message_id: Uuid,
    pub stop_reason: StopReason,
    pub has_tool_use: bool,
    pub tool_execution_count: i32,
    pub usage: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_run_linkage() {
        let parent = NewRun::new(Uuid::now_v7(), "outer", "ask inner for the time");
        let parent_run = Run {
            id: Uuid::now_v7(),
            session_id: parent.session_id,
            agent_name: parent.agent_name.clone(),
            prompt: parent.prompt.clone(),
            run_mode: RunMode::Streaming,
            parent_run_id: None,
            parent_tool_execution_id: None,
            depth: 0,
            state: RunState::PendingTools,
            previous_state: Some(RunState::PendingApi),
            current_iteration_id: None,
            tool_iterations: 0,
            usage: TokenUsage::default(),
            error_message: None,
            error_type: None,
            created_by_instance_id: None,
            claimed_by_instance_id: None,
            claimed_at: None,
            rescue_attempts: 0,
            last_rescue_at: None,
            scheduled_at: Utc::now(),
            started_at: None,
            finalized_at: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let exec_id = Uuid::now_v7();
        let child =
            NewRun::new(Uuid::now_v7(), "inner", "what time is it").as_child_of(&parent_run, exec_id);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_run_id, Some(parent_run.id));
        assert_eq!(child.parent_tool_execution_id, Some(exec_id));
    }
}
