//! # AgentPG core types
//!
//! Domain entities and state machines for the AgentPG runtime: sessions,
//! messages, runs, iterations, tool executions, instances, and the leader
//! lease, plus the engine configuration and shared error types.
//!
//! Everything here is database-agnostic; persistence semantics live behind
//! the `Store` trait in `agentpg-storage`.

pub mod config;
pub mod content;
pub mod error;
pub mod instance;
pub mod message;
pub mod run;
pub mod session;
pub mod state;
pub mod tool;

pub use config::{EngineConfig, MAX_DEPTH_LIMIT};
pub use content::{joined_text, tool_uses, ContentBlock, ToolUseRef};
pub use error::{EngineError, Result};
pub use instance::{Instance, Leader, NewInstance, LEADER_NAME};
pub use message::{Message, MessageRole, NewMessage, TokenUsage};
pub use run::{
    BatchStatus, Iteration, IterationResult, NewRun, Run, RunMode, RunUpdates,
};
pub use session::{CompactionEvent, NewSession, Session};
pub use state::{ErrorType, RunState, StopReason, ToolExecutionState};
pub use tool::{
    extract_agent_prompt, AgentDefinition, NewToolExecution, ToolDefinition, ToolExecution,
};
