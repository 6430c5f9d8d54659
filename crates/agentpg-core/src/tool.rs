// Tool executions and registry definitions
//
// A tool execution is one requested tool invocation, produced by a specific
// iteration. For agent-as-tool executions the tool worker creates a child run
// instead of executing locally; the execution stays `running` until the child
// reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ToolExecutionState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_id: Uuid,

    pub state: ToolExecutionState,

    /// Correlates with the tool_use content block that requested this call
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,

    pub is_agent_tool: bool,
    pub agent_name: Option<String>,
    pub child_run_id: Option<Uuid>,

    pub tool_output: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,

    pub claimed_by_instance_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,

    pub attempt_count: i32,
    pub max_attempts: i32,

    /// Earliest time the row may be claimed (delayed retry / snooze)
    pub scheduled_at: DateTime<Utc>,
    pub snooze_count: i32,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolExecution {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Input for creating a tool execution
#[derive(Debug, Clone)]
pub struct NewToolExecution {
    pub run_id: Uuid,
    pub iteration_id: Uuid,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub is_agent_tool: bool,
    pub agent_name: Option<String>,
    pub max_attempts: i32,
}

/// A registered tool: name, description, and a JSON schema for its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A registered agent: the model configuration and tool set runs of this
/// agent execute with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub system_prompt: String,

    /// Names of tools this agent may call; an entry naming another agent
    /// makes that tool an agent-as-tool
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Compact the session when its token count crosses the trigger
    #[serde(default)]
    pub auto_compaction: bool,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: String::new(),
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            auto_compaction: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_auto_compaction(mut self) -> Self {
        self.auto_compaction = true;
        self
    }
}

/// Fields in which an agent-as-tool prompt is looked for, in probe order.
const PROMPT_FIELDS: [&str; 5] = ["prompt", "task", "request", "message", "input"];

/// Extract the prompt string for a child run from agent-tool input.
///
/// Probes well-known fields in order; falls back to the raw JSON when none
/// holds a string.
pub fn extract_agent_prompt(input: &serde_json::Value) -> String {
    for field in PROMPT_FIELDS {
        if let Some(s) = input.get(field).and_then(|v| v.as_str()) {
            return s.to_string();
        }
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_extraction_probes_in_order() {
        assert_eq!(
            extract_agent_prompt(&json!({"prompt": "a", "task": "b"})),
            "a"
        );
        assert_eq!(extract_agent_prompt(&json!({"task": "b"})), "b");
        assert_eq!(extract_agent_prompt(&json!({"request": "c"})), "c");
        assert_eq!(extract_agent_prompt(&json!({"message": "d"})), "d");
        assert_eq!(extract_agent_prompt(&json!({"input": "e"})), "e");
    }

    #[test]
    fn prompt_extraction_falls_back_to_raw_json() {
        let input = json!({"q": 42});
        assert_eq!(extract_agent_prompt(&input), input.to_string());
        // A non-string value in a probed field is skipped
        assert_eq!(
            extract_agent_prompt(&json!({"prompt": 1, "task": "t"})),
            "t"
        );
    }

    #[test]
    fn attempts_remaining() {
        let exec = ToolExecution {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            iteration_id: Uuid::now_v7(),
            state: ToolExecutionState::Failed,
            tool_use_id: "toolu_01".into(),
            tool_name: "calc".into(),
            tool_input: json!({}),
            is_agent_tool: false,
            agent_name: None,
            child_run_id: None,
            tool_output: None,
            is_error: true,
            error_message: Some("boom".into()),
            claimed_by_instance_id: None,
            claimed_at: None,
            attempt_count: 1,
            max_attempts: 2,
            scheduled_at: Utc::now(),
            snooze_count: 0,
            last_error: Some("boom".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(exec.attempts_remaining());
    }
}
