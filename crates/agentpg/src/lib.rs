//! # AgentPG
//!
//! A PostgreSQL-backed runtime for executing LLM-driven agents across a
//! fleet of stateless worker processes. Conversation state lives exclusively
//! in the database; workers are interchangeable and may die at any time
//! without losing progress.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Client                              │
//! │ (sessions, run_sync/run_async, registries, start/stop)      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                 │                  │
//!            ▼                 ▼                  ▼
//! ┌───────────────┐  ┌──────────────────┐  ┌───────────────────┐
//! │  RunWorker    │  │   ToolWorker     │  │ Heartbeat/Elector │
//! │ (LLM loop)    │  │ (tool fan-out)   │  │ /Cleanup          │
//! └───────────────┘  └──────────────────┘  └───────────────────┘
//!            │                 │                  │
//!            ▼                 ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Store (PostgreSQL)                     │
//! │  claims via SKIP LOCKED · fan-in triggers · LISTEN/NOTIFY   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use agentpg::prelude::*;
//!
//! let client = Client::connect("postgres://localhost/agentpg", llm, EngineConfig::default()).await?;
//! client.register_agent(
//!     AgentDefinition::new("assistant", "claude-sonnet-4-5")
//!         .with_system_prompt("You are a helpful assistant.")
//!         .with_tools(["calc"]),
//! )?;
//! client.register_tool(CalcTool)?;
//! client.start().await?;
//!
//! let session = client.new_session(SessionOptions::default()).await?;
//! let response = client
//!     .run_sync(&CancellationToken::new(), session.id, "assistant", "what is 2+2?", None)
//!     .await?;
//! ```

pub mod client;

pub use client::{Client, Response, SessionOptions};

// Re-export the layers the façade is built from
pub use agentpg_core::{
    AgentDefinition, ContentBlock, EngineConfig, EngineError, ErrorType, Message, MessageRole,
    Result, Run, RunMode, RunState, Session, StopReason, TokenUsage, ToolDefinition,
    ToolExecution, ToolExecutionState,
};
pub use agentpg_storage::{MemoryStore, PostgresStore, Store, StoreError};
pub use agentpg_worker::{
    Compactor, LlmClient, LlmError, LlmOutcome, LlmRequest, RetryPolicy, Tool, ToolOutcome,
    ToolRegistry,
};

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{Client, Response, SessionOptions};
    pub use agentpg_core::{
        AgentDefinition, ContentBlock, EngineConfig, EngineError, ErrorType, RunMode, RunState,
        StopReason, ToolDefinition,
    };
    pub use agentpg_storage::{MemoryStore, PostgresStore, Store};
    pub use agentpg_worker::{
        CalcTool, Compactor, LlmClient, LlmOutcome, LlmRequest, Tool, ToolOutcome, ToolRegistry,
    };
    pub use tokio_util::sync::CancellationToken;
}
