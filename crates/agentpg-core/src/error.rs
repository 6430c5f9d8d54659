// Error types shared across the engine

use thiserror::Error;
use uuid::Uuid;

use crate::state::{RunState, ToolExecutionState};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine's public calls
#[derive(Debug, Error)]
pub enum EngineError {
    /// A run transition the state machine rejects
    #[error("invalid run transition: {from} -> {to}")]
    InvalidRunTransition { from: RunState, to: RunState },

    /// A tool-execution transition the state machine rejects
    #[error("invalid tool execution transition: {from} -> {to}")]
    InvalidToolTransition {
        from: ToolExecutionState,
        to: ToolExecutionState,
    },

    /// Entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// Agent-as-tool nesting exceeded the configured cap
    #[error("run depth {depth} exceeds max depth {max}")]
    DepthExceeded { depth: i32, max: i32 },

    /// Configuration or argument validation failed
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller's cancellation handle fired
    #[error("operation cancelled")]
    Cancelled,

    /// Storage layer error
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM collaborator error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Tool collaborator error
    #[error("tool error: {0}")]
    Tool(String),

    /// Engine bug
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Self::Tool(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
