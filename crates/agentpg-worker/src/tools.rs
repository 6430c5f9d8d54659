// Tool collaborator and per-instance registry
//
// Tools execute locally on the instance that claimed the execution row.
// The registry is populated before Client::start; availability across the
// fleet is the instance_tools join, not this map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agentpg_core::ToolDefinition;

/// Result of one tool execution
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Output captured into the tool_result block
    Success(String),

    /// Error captured into the tool_result block with is_error = true;
    /// retried while the attempt budget lasts
    Error(String),

    /// Cooperative delay: the execution goes back to the queue without
    /// spending an attempt
    Snooze(Duration),
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success(output.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Trait for tools executable by the tool worker
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name; what the model calls and what executions dispatch on
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema for the tool input
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, input: Value) -> ToolOutcome;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }
}

/// Per-instance tool registry
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

// ============================================================================
// Built-in tools for tests and examples
// ============================================================================

/// Evaluates simple `a+b` expressions; the canonical test tool
pub struct CalcTool;

#[async_trait]
impl Tool for CalcTool {
    fn name(&self) -> &str {
        "calc"
    }

    fn description(&self) -> &str {
        "Evaluate a simple arithmetic expression like '2+2'"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expr": { "type": "string", "description": "Expression of the form a+b" }
            },
            "required": ["expr"]
        })
    }

    async fn execute(&self, input: Value) -> ToolOutcome {
        let Some(expr) = input.get("expr").and_then(|v| v.as_str()) else {
            return ToolOutcome::error("missing 'expr'");
        };
        let parts: Vec<&str> = expr.split('+').map(str::trim).collect();
        if parts.len() != 2 {
            return ToolOutcome::error(format!("cannot evaluate '{}'", expr));
        }
        match (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
            (Ok(a), Ok(b)) => ToolOutcome::success((a + b).to_string()),
            _ => ToolOutcome::error(format!("cannot evaluate '{}'", expr)),
        }
    }
}

/// Echoes its input back
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    async fn execute(&self, input: Value) -> ToolOutcome {
        ToolOutcome::success(input.to_string())
    }
}

/// Always fails; for retry-path tests
pub struct FailingTool {
    message: String,
}

impl FailingTool {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _input: Value) -> ToolOutcome {
        ToolOutcome::error(self.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calc_evaluates_sums() {
        let outcome = CalcTool.execute(json!({"expr": "2+2"})).await;
        assert!(matches!(outcome, ToolOutcome::Success(s) if s == "4"));

        let outcome = CalcTool.execute(json!({"expr": "3 + 3"})).await;
        assert!(matches!(outcome, ToolOutcome::Success(s) if s == "6"));

        let outcome = CalcTool.execute(json!({"expr": "nope"})).await;
        assert!(matches!(outcome, ToolOutcome::Error(_)));
    }

    #[test]
    fn registry_round_trip() {
        let mut registry = ToolRegistry::new();
        registry.register(CalcTool);
        registry.register(EchoTool);

        assert!(registry.has("calc"));
        assert!(!registry.has("missing"));
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].name, "calc");
        assert_eq!(definitions[1].name, "echo");
    }
}
