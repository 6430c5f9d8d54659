// Content blocks
//
// A message body is an ordered list of content blocks, stored as JSONB.
// tool_use blocks carry their own ids, which correlate with tool-execution
// rows and with the tool_result blocks of the following message.

use serde::{Deserialize, Serialize};

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text { text: String },

    /// Model-requested tool invocation
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Result of a tool invocation, correlated by `tool_use_id`
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// Provider-specific block the engine passes through untouched
    Other { data: serde_json::Value },
}

impl ContentBlock {
    /// Create a text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool_use block
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Create a tool_result block
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Text of this block, if it is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// A tool_use block broken out of a message, in block order.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseRef<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a serde_json::Value,
}

/// Extract tool_use blocks from a block list, preserving block order.
pub fn tool_uses(blocks: &[ContentBlock]) -> Vec<ToolUseRef<'_>> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(ToolUseRef {
                id: id.as_str(),
                name: name.as_str(),
                input,
            }),
            _ => None,
        })
        .collect()
}

/// Concatenate the text blocks of a block list.
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| b.as_text())
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_round_trip() {
        let blocks = vec![
            ContentBlock::text("compute the sums"),
            ContentBlock::tool_use("toolu_01", "calc", json!({"expr": "2+2"})),
            ContentBlock::tool_result("toolu_01", "4", false),
            ContentBlock::tool_result("toolu_02", "division by zero", true),
            ContentBlock::Other {
                data: json!({"type": "thinking", "thinking": "..."}),
            },
        ];

        let encoded = serde_json::to_string(&blocks).unwrap();
        let decoded: Vec<ContentBlock> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(blocks, decoded);
    }

    #[test]
    fn tagged_wire_format() {
        let block = ContentBlock::text("hello");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "text", "text": "hello"}));

        let block = ContentBlock::tool_result("toolu_01", "4", false);
        let value = serde_json::to_value(&block).unwrap();
        // is_error omitted when false
        assert_eq!(
            value,
            json!({"type": "tool_result", "tool_use_id": "toolu_01", "content": "4"})
        );
    }

    #[test]
    fn tool_uses_preserve_order() {
        let blocks = vec![
            ContentBlock::text("working on it"),
            ContentBlock::tool_use("toolu_b", "calc", json!({"expr": "3+3"})),
            ContentBlock::tool_use("toolu_a", "calc", json!({"expr": "2+2"})),
        ];
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].id, "toolu_b");
        assert_eq!(uses[1].id, "toolu_a");
    }

    #[test]
    fn joined_text_skips_non_text() {
        let blocks = vec![
            ContentBlock::text("a"),
            ContentBlock::tool_use("t", "calc", json!({})),
            ContentBlock::text("b"),
        ];
        assert_eq!(joined_text(&blocks), "ab");
    }
}
