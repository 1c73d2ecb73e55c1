//! Delegation tool: hands a self-contained task to a fresh sub-agent.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::spawner::Spawner;

use super::spec::{ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec, required_str};

pub struct TaskTool {
    spawner: Spawner,
}

impl TaskTool {
    #[must_use]
    pub fn new(spawner: Spawner) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl ToolSpec for TaskTool {
    fn name(&self) -> &'static str {
        "task_tool"
    }

    fn description(&self) -> &'static str {
        "Launch a new agent to handle a complex, multi-step task autonomously. \
         Available agent type: general-purpose (research, code search, multi-step tasks; all tools \
         except delegation and the todo list). Each invocation is stateless: the agent sees only \
         the prompt you give it and returns a single final report, which the user does not see. \
         Write a detailed prompt and say exactly what the report should contain, and whether the \
         agent should write code or only research. For a known file path or a specific symbol, \
         use the read or glob tools directly instead."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "A short (3-5 word) description of the task"
                },
                "prompt": {
                    "type": "string",
                    "description": "The task for the agent to perform"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "The type of specialized agent to use for this task"
                }
            },
            "required": ["description", "prompt", "subagent_type"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::Delegates]
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let description = required_str(&input, "description")?;
        let prompt = required_str(&input, "prompt")?;
        let subagent_type = required_str(&input, "subagent_type")?;
        if prompt.trim().is_empty() {
            return Err(ToolError::invalid_input("prompt cannot be empty"));
        }

        let report = self.spawner.spawn(description, prompt, subagent_type).await;
        let mut metadata = json!({
            "description": description,
            "subagent_type": subagent_type,
        });
        let result = match report.error {
            None => ToolResult::success(report.content),
            Some(error) => {
                metadata["error"] = Value::String(error);
                ToolResult::error(report.content)
            }
        };
        Ok(result.with_metadata(metadata))
    }
}
