// Message types
//
// One message is one turn in a session: an ordered list of content blocks
// plus the token usage the provider reported for producing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::ContentBlock;

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// User input
    User,
    /// Model output (including tool_use and aggregated tool_result turns)
    Assistant,
    /// System / injected instructions
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> i64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Accumulate another usage into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// A message in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,

    /// The run that produced or consumed this message, if any
    pub run_id: Option<Uuid>,

    pub role: MessageRole,

    /// Ordered content blocks
    pub content: Vec<ContentBlock>,

    /// Usage for the model call that produced this message
    pub usage: Option<TokenUsage>,

    /// Survives compaction verbatim
    pub preserved: bool,

    /// This message is a compaction summary
    pub summary: bool,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated text of the message's text blocks.
    pub fn text(&self) -> String {
        crate::content::joined_text(&self.content)
    }

    /// Whether any block is a tool_use block.
    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(|b| b.is_tool_use())
    }
}

/// Input for inserting a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub run_id: Option<Uuid>,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub usage: Option<TokenUsage>,
    pub preserved: bool,
    pub summary: bool,
}

impl NewMessage {
    /// A plain user message for a run.
    pub fn user(session_id: Uuid, run_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            session_id,
            run_id: Some(run_id),
            role: MessageRole::User,
            content: vec![ContentBlock::text(text)],
            usage: None,
            preserved: false,
            summary: false,
        }
    }

    /// An assistant message with the given blocks.
    pub fn assistant(
        session_id: Uuid,
        run_id: Uuid,
        content: Vec<ContentBlock>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            session_id,
            run_id: Some(run_id),
            role: MessageRole::Assistant,
            content,
            usage,
            preserved: false,
            summary: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut usage = TokenUsage::new(100, 20);
        usage.add(TokenUsage::new(50, 5));
        assert_eq!(usage.input_tokens, 150);
        assert_eq!(usage.output_tokens, 25);
        assert_eq!(usage.total(), 175);
    }

    #[test]
    fn usage_saturates() {
        let mut usage = TokenUsage::new(i64::MAX, 0);
        usage.add(TokenUsage::new(1, 1));
        assert_eq!(usage.input_tokens, i64::MAX);
    }

    #[test]
    fn user_message_builder() {
        let session_id = Uuid::now_v7();
        let run_id = Uuid::now_v7();
        let msg = NewMessage::user(session_id, run_id, "hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.content.len(), 1);
        assert_eq!(msg.content[0].as_text(), Some("hello"));
    }
}
