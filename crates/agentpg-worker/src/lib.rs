//! # AgentPG workers
//!
//! The moving parts of an AgentPG instance:
//!
//! - [`HeartbeatService`] — fleet membership refresh
//! - [`LeaderElector`] — TTL-lease leader election
//! - [`CleanupService`] — leader-only stale/stuck/expired sweeps
//! - [`RunWorker`] — claims runs and drives the run state machine
//! - [`ToolWorker`] — claims tool executions, dispatches to local tools or
//!   spawns agent-as-tool child runs
//!
//! plus the collaborator seams the engine is defined against: [`LlmClient`],
//! [`Tool`]/[`ToolRegistry`], and [`Compactor`].

pub mod backoff;
pub mod cleanup;
pub mod compaction;
pub mod heartbeat;
pub mod leader;
pub mod llm;
pub mod run_worker;
pub mod tool_worker;
pub mod tools;

pub use backoff::RetryPolicy;
pub use cleanup::{CleanupCallbacks, CleanupService};
pub use compaction::{CompactionError, CompactionOutcome, Compactor, KeepRecentCompactor};
pub use heartbeat::HeartbeatService;
pub use leader::LeaderElector;
pub use llm::{
    HangingLlm, LlmClient, LlmError, LlmOutcome, LlmRequest, LlmScript, ScriptedLlm,
    ScriptedToolUse,
};
pub use run_worker::RunWorker;
pub use tool_worker::ToolWorker;
pub use tools::{CalcTool, EchoTool, FailingTool, Tool, ToolOutcome, ToolRegistry};
