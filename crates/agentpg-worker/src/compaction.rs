// Compaction collaborator
//
// The summarization strategy lives outside the engine. The run worker
// invokes the compactor when a session crosses the configured token trigger,
// then applies the outcome: insert the summary message, archive everything
// not preserved, and record a compaction event.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentpg_core::Message;

/// What the compactor decided
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Messages kept verbatim
    pub preserved_message_ids: Vec<Uuid>,

    /// Summary text standing in for everything else
    pub summary: String,

    /// Strategy label recorded on the compaction event
    pub strategy: String,

    pub duration: Duration,
}

/// Compaction errors are non-fatal; the run proceeds uncompacted
#[derive(Debug, thiserror::Error)]
#[error("compaction error: {0}")]
pub struct CompactionError(pub String);

/// Trait for compaction strategies
#[async_trait]
pub trait Compactor: Send + Sync {
    async fn compact(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        target_tokens: i64,
    ) -> Result<CompactionOutcome, CompactionError>;
}

/// Keeps the most recent messages verbatim and folds the rest into a stub
/// summary line. Mostly useful in tests; production deployments plug in an
/// LLM-backed strategy.
pub struct KeepRecentCompactor {
    pub keep_last: usize,
}

impl KeepRecentCompactor {
    pub fn new(keep_last: usize) -> Self {
        Self { keep_last }
    }
}

#[async_trait]
impl Compactor for KeepRecentCompactor {
    async fn compact(
        &self,
        _cancel: &CancellationToken,
        messages: &[Message],
        _target_tokens: i64,
    ) -> Result<CompactionOutcome, CompactionError> {
        let preserved: Vec<Uuid> = messages
            .iter()
            .rev()
            .take(self.keep_last)
            .map(|m| m.id)
            .collect();
        let folded = messages.len().saturating_sub(preserved.len());
        Ok(CompactionOutcome {
            preserved_message_ids: preserved,
            summary: format!("[{} earlier messages summarized]", folded),
            strategy: "keep_recent".to_string(),
            duration: Duration::ZERO,
        })
    }
}
