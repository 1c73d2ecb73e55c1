//! Tool dispatch: name resolution, execution, and result normalization.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::core::spawner::Spawner;
use crate::error_taxonomy::ErrorEnvelope;
use crate::llm_client::LlmClient;
use crate::models::Tool;

use super::file::{EditFileTool, ListDirTool, MultiEditTool, ReadFileTool, WriteFileTool};
use super::search::{GlobTool, GrepTool};
use super::shell::BashTool;
use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};
use super::task::TaskTool;
use super::todo::{SharedTodoList, TodoWriteTool};
use super::web_fetch::WebFetchTool;

/// Fatal to the agent loop: the model asked for a tool this agent does not carry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Tool '{name}' is not registered for this agent")]
    UnknownTool { name: String },
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolSpec>>,
    context: ToolContext,
}

impl ToolRegistry {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolSpec>> {
        self.tools.iter().find(|tool| tool.name() == name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ToolSpec>, ConfigurationError> {
        self.get(name).ok_or_else(|| ConfigurationError::UnknownTool {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    /// Tool definitions in registration order, as sent to the model.
    #[must_use]
    pub fn to_api_tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|tool| Tool {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Run an approved tool. Tool failures come back as failed results; only an
    /// unknown name is an error.
    pub async fn execute(&self, name: &str, input: Value) -> Result<ToolResult, ConfigurationError> {
        let tool = self.resolve(name)?;
        tracing::debug!(tool = name, read_only = tool.is_read_only(), "executing tool");
        match tool.execute(input, &self.context).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::debug!(tool = name, error = %err, "tool failed");
                Ok(failed_result(name, err))
            }
        }
    }
}

/// Failed result carrying the error envelope in its metadata.
#[must_use]
pub fn failed_result(tool_name: &str, err: ToolError) -> ToolResult {
    let content = format_tool_error(&err, tool_name);
    let mut metadata = ErrorEnvelope::from(err.clone()).to_metadata();
    if let ToolError::Timeout {
        partial_output: Some(partial),
        ..
    } = &err
        && let Some(map) = metadata.as_object_mut()
    {
        map.insert("partial_output".to_string(), Value::String(partial.clone()));
    }
    ToolResult::error(content).with_metadata(metadata)
}

/// Terminal result for an invocation the human declined.
#[must_use]
pub fn rejection_result(tool_name: &str, input: &Value) -> ToolResult {
    ToolResult::error(format!(
        "Human rejected to run this tool '{tool_name}' with arguments {input}, try different tool or different input"
    ))
    .with_metadata(serde_json::json!({ "rejected": true }))
}

fn format_tool_error(err: &ToolError, tool_name: &str) -> String {
    match err {
        ToolError::InvalidInput { message } => {
            format!("Invalid input for tool '{tool_name}': {message}")
        }
        ToolError::MissingField { field } => {
            format!("Tool '{tool_name}' is missing required field '{field}'")
        }
        ToolError::Precondition { message } => message.clone(),
        ToolError::NotFound { path } => format!("File does not exist: {}", path.display()),
        ToolError::PermissionDenied { message } => {
            format!("Tool '{tool_name}' was denied: {message}")
        }
        ToolError::Timeout {
            seconds,
            partial_output,
        } => {
            let mut text = format!(
                "Tool '{tool_name}' timed out after {seconds}s. Try a narrower scope or a longer timeout."
            );
            if let Some(partial) = partial_output.as_deref().filter(|p| !p.is_empty()) {
                text.push_str("\n\nPartial output:\n");
                text.push_str(partial);
            }
            text
        }
        ToolError::ExecutionFailed { message } => message.clone(),
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn ToolSpec>>,
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl ToolSpec + 'static) -> Self {
        if self.tools.iter().any(|existing| existing.name() == tool.name()) {
            tracing::warn!(tool = tool.name(), "duplicate tool registration ignored");
            return self;
        }
        self.tools.push(Arc::new(tool));
        self
    }

    #[must_use]
    pub fn with_file_tools(self) -> Self {
        self.with_tool(ReadFileTool)
            .with_tool(WriteFileTool)
            .with_tool(EditFileTool)
            .with_tool(MultiEditTool)
            .with_tool(ListDirTool)
    }

    #[must_use]
    pub fn with_search_tools(self) -> Self {
        self.with_tool(GlobTool).with_tool(GrepTool)
    }

    #[must_use]
    pub fn with_shell_tools(self) -> Self {
        self.with_tool(BashTool)
    }

    #[must_use]
    pub fn with_web_tools(self, client: Arc<dyn LlmClient>) -> Self {
        self.with_tool(WebFetchTool::new(client))
    }

    #[must_use]
    pub fn with_task_tool(self, spawner: Spawner) -> Self {
        self.with_tool(TaskTool::new(spawner))
    }

    #[must_use]
    pub fn with_todo_tool(self, list: SharedTodoList) -> Self {
        self.with_tool(TodoWriteTool::new(list))
    }

    #[must_use]
    pub fn build(self, context: ToolContext) -> ToolRegistry {
        ToolRegistry {
            tools: self.tools,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::spec::ToolCapability;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingTool;

    #[async_trait]
    impl ToolSpec for FailingTool {
        fn name(&self) -> &'static str {
            "failing_tool"
        }
        fn description(&self) -> &'static str {
            "always fails"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capabilities(&self) -> Vec<ToolCapability> {
            vec![ToolCapability::ReadOnly]
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Err(ToolError::precondition("read it first"))
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_configuration_error() {
        let registry = ToolRegistryBuilder::new().build(ToolContext::new("/tmp"));
        let err = registry.execute("nope", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownTool {
                name: "nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn tool_errors_become_failed_results_with_envelope() {
        let registry = ToolRegistryBuilder::new()
            .with_tool(FailingTool)
            .build(ToolContext::new("/tmp"));
        let result = registry
            .execute("failing_tool", json!({}))
            .await
            .expect("registered");
        assert!(!result.success);
        assert_eq!(result.content, "read it first");
        let metadata = result.metadata.expect("metadata");
        assert_eq!(metadata["error"]["category"], "precondition");
        assert_eq!(metadata["error"]["recoverable"], true);
    }

    #[test]
    fn rejection_text_names_tool_and_arguments() {
        let result = rejection_result("bash_tool", &json!({"command": "ls"}));
        assert!(!result.success);
        assert_eq!(
            result.content,
            "Human rejected to run this tool 'bash_tool' with arguments {\"command\":\"ls\"}, try different tool or different input"
        );
    }

    #[test]
    fn builder_keeps_registration_order_and_skips_duplicates() {
        let registry = ToolRegistryBuilder::new()
            .with_file_tools()
            .with_search_tools()
            .with_tool(GlobTool)
            .build(ToolContext::new("/tmp"));
        assert_eq!(
            registry.names(),
            vec![
                "read_tool",
                "write_tool",
                "edit_tool",
                "multi_edit_tool",
                "ls_tool",
                "glob_tool",
                "grep_tool"
            ]
        );
        assert_eq!(registry.to_api_tools().len(), 7);
    }

    #[test]
    fn timeout_metadata_keeps_partial_output() {
        let result = failed_result(
            "bash_tool",
            ToolError::Timeout {
                seconds: 1,
                partial_output: Some("half".into()),
            },
        );
        assert!(result.content.contains("Partial output:\nhalf"));
        assert_eq!(result.metadata.expect("metadata")["partial_output"], "half");
    }
}
