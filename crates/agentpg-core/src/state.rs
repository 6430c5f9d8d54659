// Run and tool-execution state machines.
//
// Storage is the enforcement point for transitions; these predicates are the
// single source of truth it consults. Terminal states are sinks, same-state
// transitions are rejected, and the only way back from a terminal state is
// the explicit tool retry (failed -> pending).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting to be claimed by a run worker
    Pending,

    /// Claimed; an LLM call is in flight or about to be
    PendingApi,

    /// Waiting for tool executions of the current iteration to finish
    PendingTools,

    /// Model paused (pause_turn / max_tokens); resumes on the next claim
    AwaitingContinuation,

    /// Terminal: finished normally
    Completed,

    /// Terminal: explicitly cancelled
    Cancelled,

    /// Terminal: unrecoverable error
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// States in which some worker may hold a claim on the run.
    pub fn is_workable(&self) -> bool {
        matches!(self, Self::PendingApi | Self::PendingTools)
    }

    /// States a run worker claims from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingContinuation)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() || *self == to {
            return false;
        }
        match (*self, to) {
            // Claim paths
            (Self::Pending, Self::PendingApi) => true,
            (Self::AwaitingContinuation, Self::PendingApi) => true,

            // Stop-reason dispatch
            (Self::PendingApi, Self::Completed) => true,
            (Self::PendingApi, Self::PendingTools) => true,
            (Self::PendingApi, Self::AwaitingContinuation) => true,

            // Tool fan-in
            (Self::PendingTools, Self::PendingApi) => true,

            // Any non-terminal run can be cancelled, failed, or rescued
            (_, Self::Cancelled) => true,
            (_, Self::Failed) => true,
            (_, Self::Pending) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::PendingApi => write!(f, "pending_api"),
            Self::PendingTools => write!(f, "pending_tools"),
            Self::AwaitingContinuation => write!(f, "awaiting_continuation"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "pending_api" => Ok(Self::PendingApi),
            "pending_tools" => Ok(Self::PendingTools),
            "awaiting_continuation" => Ok(Self::AwaitingContinuation),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown run state: {}", s)),
        }
    }
}

/// Lifecycle state of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionState {
    /// Waiting to be claimed by a tool worker
    Pending,

    /// Claimed and executing (for agent-as-tool: child run in flight)
    Running,

    /// Terminal: produced output
    Completed,

    /// Terminal: errored or timed out
    Failed,

    /// Terminal: parent run was cancelled
    Skipped,
}

impl ToolExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: ToolExecutionState) -> bool {
        if *self == to {
            return false;
        }
        match (*self, to) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Skipped) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Skipped) => true,
            // Retry resets claim fields; attempt budget is checked by storage
            (Self::Failed, Self::Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ToolExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ToolExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown tool execution state: {}", s)),
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    StopSequence,
    ToolUse,
    PauseTurn,
    MaxTokens,
    Refusal,
    /// Anything the engine does not recognize; treated as a normal end of turn
    #[serde(untagged)]
    Other(String),
}

impl StopReason {
    /// The run state a completed iteration with this stop reason leads to.
    pub fn next_run_state(&self) -> RunState {
        match self {
            Self::EndTurn | Self::StopSequence | Self::Other(_) => RunState::Completed,
            Self::ToolUse => RunState::PendingTools,
            Self::PauseTurn | Self::MaxTokens => RunState::AwaitingContinuation,
            Self::Refusal => RunState::Failed,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndTurn => write!(f, "end_turn"),
            Self::StopSequence => write!(f, "stop_sequence"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::PauseTurn => write!(f, "pause_turn"),
            Self::MaxTokens => write!(f, "max_tokens"),
            Self::Refusal => write!(f, "refusal"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "stop_sequence" => Self::StopSequence,
            "tool_use" => Self::ToolUse,
            "pause_turn" => Self::PauseTurn,
            "max_tokens" => Self::MaxTokens,
            "refusal" => Self::Refusal,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Classified cause stored on failed runs and tool executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Claimer died; rescue budget exhausted
    Orphan,
    /// Run or tool exceeded its deadline
    Timeout,
    /// LLM API error
    Api,
    /// Tool execution failed non-retryably
    Tool,
    /// Engine bug
    Internal,
    /// Explicit cancellation
    Cancelled,
    /// Model declined to answer
    Refusal,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orphan => write!(f, "orphan"),
            Self::Timeout => write!(f, "timeout"),
            Self::Api => write!(f, "api"),
            Self::Tool => write!(f, "tool"),
            Self::Internal => write!(f, "internal"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Refusal => write!(f, "refusal"),
        }
    }
}

impl std::str::FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orphan" => Ok(Self::Orphan),
            "timeout" => Ok(Self::Timeout),
            "api" => Ok(Self::Api),
            "tool" => Ok(Self::Tool),
            "internal" => Ok(Self::Internal),
            "cancelled" => Ok(Self::Cancelled),
            "refusal" => Ok(Self::Refusal),
            _ => Err(format!("unknown error type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RUN_STATES: [RunState; 7] = [
        RunState::Pending,
        RunState::PendingApi,
        RunState::PendingTools,
        RunState::AwaitingContinuation,
        RunState::Completed,
        RunState::Cancelled,
        RunState::Failed,
    ];

    #[test]
    fn run_claim_transitions() {
        assert!(RunState::Pending.can_transition_to(RunState::PendingApi));
        assert!(RunState::AwaitingContinuation.can_transition_to(RunState::PendingApi));
        assert!(!RunState::PendingTools.can_transition_to(RunState::AwaitingContinuation));
    }

    #[test]
    fn run_terminals_are_sinks() {
        for from in [RunState::Completed, RunState::Cancelled, RunState::Failed] {
            for to in ALL_RUN_STATES {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn run_same_state_rejected() {
        for state in ALL_RUN_STATES {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn run_rescue_from_any_non_terminal() {
        for from in [
            RunState::PendingApi,
            RunState::PendingTools,
            RunState::AwaitingContinuation,
        ] {
            assert!(from.can_transition_to(RunState::Pending), "{} -> pending", from);
            assert!(from.can_transition_to(RunState::Cancelled));
            assert!(from.can_transition_to(RunState::Failed));
        }
    }

    #[test]
    fn run_fan_in_transition() {
        assert!(RunState::PendingTools.can_transition_to(RunState::PendingApi));
        assert!(!RunState::PendingTools.can_transition_to(RunState::Completed));
    }

    #[test]
    fn tool_transitions() {
        assert!(ToolExecutionState::Pending.can_transition_to(ToolExecutionState::Running));
        assert!(ToolExecutionState::Pending.can_transition_to(ToolExecutionState::Skipped));
        assert!(ToolExecutionState::Running.can_transition_to(ToolExecutionState::Completed));
        assert!(ToolExecutionState::Running.can_transition_to(ToolExecutionState::Failed));
        assert!(ToolExecutionState::Running.can_transition_to(ToolExecutionState::Skipped));
        assert!(ToolExecutionState::Failed.can_transition_to(ToolExecutionState::Pending));

        assert!(!ToolExecutionState::Pending.can_transition_to(ToolExecutionState::Completed));
        assert!(!ToolExecutionState::Completed.can_transition_to(ToolExecutionState::Pending));
        assert!(!ToolExecutionState::Skipped.can_transition_to(ToolExecutionState::Pending));
    }

    #[test]
    fn stop_reason_dispatch() {
        assert_eq!(StopReason::EndTurn.next_run_state(), RunState::Completed);
        assert_eq!(StopReason::StopSequence.next_run_state(), RunState::Completed);
        assert_eq!(StopReason::ToolUse.next_run_state(), RunState::PendingTools);
        assert_eq!(
            StopReason::PauseTurn.next_run_state(),
            RunState::AwaitingContinuation
        );
        assert_eq!(
            StopReason::MaxTokens.next_run_state(),
            RunState::AwaitingContinuation
        );
        assert_eq!(StopReason::Refusal.next_run_state(), RunState::Failed);
        // Unknown stop reasons end the turn
        assert_eq!(
            StopReason::from("some_future_reason").next_run_state(),
            RunState::Completed
        );
    }

    #[test]
    fn state_string_round_trip() {
        for state in ALL_RUN_STATES {
            assert_eq!(state.to_string().parse::<RunState>().unwrap(), state);
        }
        for state in [
            ToolExecutionState::Pending,
            ToolExecutionState::Running,
            ToolExecutionState::Completed,
            ToolExecutionState::Failed,
            ToolExecutionState::Skipped,
        ] {
            assert_eq!(
                state.to_string().parse::<ToolExecutionState>().unwrap(),
                state
            );
        }
    }
}
