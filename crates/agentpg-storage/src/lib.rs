//! # AgentPG storage
//!
//! The storage contract for the AgentPG runtime and its two implementations:
//!
//! - [`PostgresStore`] — production persistence on sqlx/PostgreSQL. Claims
//!   use CTE + `FOR UPDATE SKIP LOCKED`; tool fan-in, child-run completion,
//!   and notification emission are owned by database triggers (see
//!   `migrations/`).
//! - [`MemoryStore`] — the same semantics behind a process-local lock, for
//!   tests and embedded use.
//!
//! The engine never talks to the database directly; every persistence
//! guarantee it relies on is written down on the [`Store`] trait.

pub mod memory;
pub mod notify;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use notify::{
    Notification, NotifyChannel, NotifyHub, CHANNEL_ITERATION_POLL, CHANNEL_RUN_STATE,
    CHANNEL_TOOL_PENDING,
};
pub use postgres::PostgresStore;
pub use store::{NewCompactionEvent, Store, StoreError, ToolFailureOutcome};
