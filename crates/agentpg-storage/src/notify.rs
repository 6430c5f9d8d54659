//! Notification channels
//!
//! Storage emits a notification on every run-state change, every pending
//! tool-execution insert, and every batch-iteration poll request. Workers
//! treat these strictly as wake-up hints; the poll intervals guarantee
//! liveness when a delivery is dropped.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentpg_core::RunState;

/// PostgreSQL channel carrying run-state changes.
pub const CHANNEL_RUN_STATE: &str = "agentpg_run_state";

/// PostgreSQL channel carrying newly pending tool executions.
pub const CHANNEL_TOOL_PENDING: &str = "agentpg_tool_pending";

/// PostgreSQL channel for batch iterations due for a poll.
pub const CHANNEL_ITERATION_POLL: &str = "agentpg_iteration_poll";

/// A subscribable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyChannel {
    RunState,
    ToolPending,
    IterationPoll,
}

impl NotifyChannel {
    pub fn pg_channel(&self) -> &'static str {
        match self {
            Self::RunState => CHANNEL_RUN_STATE,
            Self::ToolPending => CHANNEL_TOOL_PENDING,
            Self::IterationPoll => CHANNEL_ITERATION_POLL,
        }
    }

    pub fn from_pg_channel(name: &str) -> Option<Self> {
        match name {
            CHANNEL_RUN_STATE => Some(Self::RunState),
            CHANNEL_TOOL_PENDING => Some(Self::ToolPending),
            CHANNEL_ITERATION_POLL => Some(Self::IterationPoll),
            _ => None,
        }
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    RunState { run_id: Uuid, state: RunState },
    ToolPending { tool_execution_id: Uuid },
    IterationPoll { iteration_id: Uuid },
}

impl Notification {
    pub fn channel(&self) -> NotifyChannel {
        match self {
            Self::RunState { .. } => NotifyChannel::RunState,
            Self::ToolPending { .. } => NotifyChannel::ToolPending,
            Self::IterationPoll { .. } => NotifyChannel::IterationPoll,
        }
    }
}

/// Per-channel broadcast fan-out shared by the stores.
///
/// `PostgresStore` feeds it from a `PgListener` pump; `MemoryStore` publishes
/// directly from its mutating operations. A send with no subscribers is not
/// an error: notifications are hints.
#[derive(Clone)]
pub struct NotifyHub {
    run_state: tokio::sync::broadcast::Sender<Notification>,
    tool_pending: tokio::sync::broadcast::Sender<Notification>,
    iteration_poll: tokio::sync::broadcast::Sender<Notification>,
}

impl NotifyHub {
    pub fn new() -> Self {
        let (run_state, _) = tokio::sync::broadcast::channel(256);
        let (tool_pending, _) = tokio::sync::broadcast::channel(256);
        let (iteration_poll, _) = tokio::sync::broadcast::channel(256);
        Self {
            run_state,
            tool_pending,
            iteration_poll,
        }
    }

    fn sender(&self, channel: NotifyChannel) -> &tokio::sync::broadcast::Sender<Notification> {
        match channel {
            NotifyChannel::RunState => &self.run_state,
            NotifyChannel::ToolPending => &self.tool_pending,
            NotifyChannel::IterationPoll => &self.iteration_poll,
        }
    }

    pub fn subscribe(
        &self,
        channel: NotifyChannel,
    ) -> tokio::sync::broadcast::Receiver<Notification> {
        self.sender(channel).subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.sender(notification.channel()).send(notification);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let n = Notification::RunState {
            run_id: Uuid::now_v7(),
            state: RunState::PendingApi,
        };
        let json = serde_json::to_string(&n).unwrap();
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(n, parsed);
    }

    #[test]
    fn channel_names() {
        assert_eq!(NotifyChannel::RunState.pg_channel(), "agentpg_run_state");
        assert_eq!(
            NotifyChannel::from_pg_channel("agentpg_tool_pending"),
            Some(NotifyChannel::ToolPending)
        );
        assert_eq!(NotifyChannel::from_pg_channel("other"), None);
    }
}
