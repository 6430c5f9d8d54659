// LLM collaborator
//
// The engine talks to the model through this trait only; the HTTP transport
// lives elsewhere. Errors are classified so the run worker can tell a
// retryable transport hiccup from a terminal request failure.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use agentpg_core::{ContentBlock, Message, RunMode, StopReason, TokenUsage, ToolDefinition};

/// One model invocation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<Message>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f32>,
    pub run_mode: RunMode,
}

/// What the model returned
#[derive(Debug, Clone)]
pub struct LlmOutcome {
    /// Ordered content blocks of the assistant message
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

/// LLM errors, classified for the retry policy
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Network / connection failure; retryable
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider backpressure; retryable
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The request itself is broken; terminal
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model declined; terminal, surfaces as ErrorType::Refusal
    #[error("model refused: {0}")]
    Refusal(String),

    /// The caller's cancellation handle fired
    #[error("invocation cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }
}

/// Trait for LLM providers
///
/// Batch-mode runs go through the same call: the implementation owns batch
/// submission and polling and returns once the result is available,
/// recording batch bookkeeping on the iteration as it goes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        request: LlmRequest,
    ) -> Result<LlmOutcome, LlmError>;
}

// ============================================================================
// Scripted client for tests
// ============================================================================

/// A scripted tool call for [`ScriptedLlm`]
#[derive(Debug, Clone)]
pub struct ScriptedToolUse {
    pub name: String,
    pub input: serde_json::Value,
}

impl ScriptedToolUse {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// One scripted response
#[derive(Debug, Clone)]
pub enum LlmScript {
    /// Plain text answer, stop reason end_turn
    Text(String),

    /// Text plus tool_use blocks, stop reason tool_use
    ToolUse {
        text: Option<String>,
        calls: Vec<ScriptedToolUse>,
    },

    /// Truncated answer, stop reason max_tokens
    MaxTokens(String),

    /// Paused answer, stop reason pause_turn
    PauseTurn(String),

    /// Stop reason refusal
    Refusal(String),

    /// A transport error (retryable)
    TransportError(String),

    /// An invalid-request error (terminal)
    InvalidRequest(String),
}

/// Scripted LLM client for unit and integration tests
///
/// Responses are consumed in order, per model; a model without its own
/// script falls back to the default script. When a script runs out the
/// client keeps answering with plain text.
pub struct ScriptedLlm {
    default_script: Vec<LlmScript>,
    per_model: HashMap<String, Vec<LlmScript>>,
    cursors: cursors::Cursors,
    tool_use_counter: AtomicUsize,
}

/// Per-model consumption cursors
mod cursors {
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Cursors {
        inner: Mutex<HashMap<String, usize>>,
    }

    impl Cursors {
        pub fn next(&self, key: &str) -> usize {
            let mut inner = self.inner.lock().unwrap();
            let cursor = inner.entry(key.to_string()).or_insert(0);
            let value = *cursor;
            *cursor += 1;
            value
        }
    }
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            default_script: Vec::new(),
            per_model: HashMap::new(),
            cursors: Default::default(),
            tool_use_counter: AtomicUsize::new(0),
        }
    }

    /// Append a step to the default script
    pub fn then(mut self, step: LlmScript) -> Self {
        self.default_script.push(step);
        self
    }

    /// Shorthand for a plain text step
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(LlmScript::Text(text.into()))
    }

    /// Shorthand for a tool_use step
    pub fn then_tool_use(self, calls: Vec<ScriptedToolUse>) -> Self {
        self.then(LlmScript::ToolUse { text: None, calls })
    }

    /// Set the script for one model, overriding the default
    pub fn script_for(mut self, model: impl Into<String>, steps: Vec<LlmScript>) -> Self {
        self.per_model.insert(model.into(), steps);
        self
    }

    fn next_step(&self, model: &str) -> LlmScript {
        let (key, script) = match self.per_model.get(model) {
            Some(script) => (model, script),
            None => ("", &self.default_script),
        };
        let cursor = self.cursors.next(key);
        script
            .get(cursor)
            .cloned()
            .unwrap_or_else(|| LlmScript::Text("ok".to_string()))
    }

    fn next_tool_use_id(&self) -> String {
        let n = self.tool_use_counter.fetch_add(1, Ordering::Relaxed);
        format!("toolu_{:02}", n)
    }

    fn usage_for(request: &LlmRequest, output: &str) -> TokenUsage {
        // Rough word counts keep compaction-trigger tests meaningful
        let input: usize = request
            .messages
            .iter()
            .map(|m| m.text().split_whitespace().count() + 8)
            .sum();
        TokenUsage::new(input as i64, output.split_whitespace().count() as i64 + 4)
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        request: LlmRequest,
    ) -> Result<LlmOutcome, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        match self.next_step(&request.model) {
            LlmScript::Text(text) => Ok(LlmOutcome {
                usage: Self::usage_for(&request, &text),
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::EndTurn,
            }),
            LlmScript::ToolUse { text, calls } => {
                let mut content = Vec::new();
                if let Some(text) = &text {
                    content.push(ContentBlock::text(text.clone()));
                }
                for call in calls {
                    content.push(ContentBlock::tool_use(
                        self.next_tool_use_id(),
                        call.name,
                        call.input,
                    ));
                }
                Ok(LlmOutcome {
                    usage: Self::usage_for(&request, text.as_deref().unwrap_or_default()),
                    content,
                    stop_reason: StopReason::ToolUse,
                })
            }
            LlmScript::MaxTokens(text) => Ok(LlmOutcome {
                usage: Self::usage_for(&request, &text),
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::MaxTokens,
            }),
            LlmScript::PauseTurn(text) => Ok(LlmOutcome {
                usage: Self::usage_for(&request, &text),
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::PauseTurn,
            }),
            LlmScript::Refusal(text) => Ok(LlmOutcome {
                usage: Self::usage_for(&request, &text),
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::Refusal,
            }),
            LlmScript::TransportError(message) => Err(LlmError::Transport(message)),
            LlmScript::InvalidRequest(message) => Err(LlmError::InvalidRequest(message)),
        }
    }
}

/// An LLM client that blocks until cancelled; for cancellation tests
pub struct HangingLlm;

#[async_trait]
impl LlmClient for HangingLlm {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        _request: LlmRequest,
    ) -> Result<LlmOutcome, LlmError> {
        cancel.cancelled().await;
        Err(LlmError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            system_prompt: String::new(),
            tools: vec![],
            messages: vec![],
            max_tokens: None,
            temperature: None,
            run_mode: RunMode::Streaming,
        }
    }

    #[tokio::test]
    async fn scripts_consume_in_order() {
        let llm = ScriptedLlm::new()
            .then_text("first")
            .then_tool_use(vec![ScriptedToolUse::new("calc", json!({"expr": "2+2"}))]);
        let cancel = CancellationToken::new();

        let outcome = llm.invoke(&cancel, request("m")).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert_eq!(outcome.content[0].as_text(), Some("first"));

        let outcome = llm.invoke(&cancel, request("m")).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ToolUse);
        assert!(outcome.content[0].is_tool_use());

        // Script exhausted: keeps answering
        let outcome = llm.invoke(&cancel, request("m")).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn per_model_scripts_are_independent() {
        let llm = ScriptedLlm::new()
            .script_for("outer", vec![LlmScript::Text("outer says".into())])
            .script_for("inner", vec![LlmScript::Text("inner says".into())]);
        let cancel = CancellationToken::new();

        let outer = llm.invoke(&cancel, request("outer")).await.unwrap();
        let inner = llm.invoke(&cancel, request("inner")).await.unwrap();
        assert_eq!(outer.content[0].as_text(), Some("outer says"));
        assert_eq!(inner.content[0].as_text(), Some("inner says"));
    }

    #[test]
    fn error_classification() {
        assert!(LlmError::Transport("t".into()).retryable());
        assert!(LlmError::RateLimited("r".into()).retryable());
        assert!(!LlmError::InvalidRequest("i".into()).retryable());
        assert!(!LlmError::Refusal("no".into()).retryable());
    }
}
