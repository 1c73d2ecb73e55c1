//! Task list state and the `todo_write_tool` that replaces it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::spec::{ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec};

pub const TODO_WRITE_TOOL_NAME: &str = "todo_write_tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    High,
    Medium,
    Low,
}

impl TodoPriority {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
    pub id: String,
}

/// Why a proposed list was refused. The stored list is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskListRejection {
    #[error("todos must be an array of task objects")]
    NotAList,
    #[error("Todo {index}: content cannot be empty")]
    EmptyContent { index: usize },
    #[error("Todo {index}: invalid status '{value}'. Must be one of: pending, in_progress, completed")]
    InvalidStatus { index: usize, value: String },
    #[error("Todo {index}: invalid priority '{value}'. Must be one of: high, medium, low")]
    InvalidPriority { index: usize, value: String },
    #[error("Only one task can be in_progress at a time, found {count}")]
    MultipleInProgress { count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoList {
    items: Vec<TaskRecord>,
}

impl TodoList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn items(&self) -> &[TaskRecord] {
        &self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the whole list, or keep the current one and report why not.
    pub fn write(&mut self, mut records: Vec<TaskRecord>) -> Result<(), TaskListRejection> {
        let count = records
            .iter()
            .filter(|record| record.status == TodoStatus::InProgress)
            .count();
        if count > 1 {
            return Err(TaskListRejection::MultipleInProgress { count });
        }
        for record in &mut records {
            if record.id.trim().is_empty() {
                record.id = Uuid::new_v4().to_string();
            }
        }
        self.items = records;
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.items).unwrap_or(Value::Array(Vec::new()))
    }
}

impl fmt::Display for TodoList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.items {
            let mark = match record.status {
                TodoStatus::Pending => "[ ]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Completed => "[x]",
            };
            writeln!(f, "{mark} {}", record.content)?;
        }
        Ok(())
    }
}

pub type SharedTodoList = Arc<Mutex<TodoList>>;

#[must_use]
pub fn new_shared_todo_list() -> SharedTodoList {
    Arc::new(Mutex::new(TodoList::new()))
}

/// Turn the raw `todos` argument into typed records.
pub fn parse_records(raw: &Value) -> Result<Vec<TaskRecord>, TaskListRejection> {
    let items = raw.as_array().ok_or(TaskListRejection::NotAList)?;
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let index = idx + 1;
            let field = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or_default();

            let content = field("content").trim();
            if content.is_empty() {
                return Err(TaskListRejection::EmptyContent { index });
            }
            let status = TodoStatus::parse(field("status")).ok_or_else(|| {
                TaskListRejection::InvalidStatus {
                    index,
                    value: field("status").to_string(),
                }
            })?;
            let priority = match item.get("priority") {
                None | Some(Value::Null) => TodoPriority::Medium,
                Some(_) => TodoPriority::parse(field("priority")).ok_or_else(|| {
                    TaskListRejection::InvalidPriority {
                        index,
                        value: field("priority").to_string(),
                    }
                })?,
            };
            Ok(TaskRecord {
                content: content.to_string(),
                status,
                priority,
                id: field("id").to_string(),
            })
        })
        .collect()
}

pub struct TodoWriteTool {
    list: SharedTodoList,
}

impl TodoWriteTool {
    pub fn new(list: SharedTodoList) -> Self {
        Self { list }
    }
}

#[async_trait]
impl ToolSpec for TodoWriteTool {
    fn name(&self) -> &'static str {
        TODO_WRITE_TOOL_NAME
    }

    fn description(&self) -> &'static str {
        "Create and manage a structured task list for the current session. The list is replaced \
         in full on every call. Each todo has content, status (pending, in_progress, completed), \
         priority (high, medium, low) and an id. Only one todo may be in_progress at a time."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The complete updated todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string", "minLength": 1 },
                            "status": { "type": "string", "enum": ["pending", "in_progress", "completed"] },
                            "priority": { "type": "string", "enum": ["high", "medium", "low"] },
                            "id": { "type": "string" }
                        },
                        "required": ["content", "status", "priority", "id"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly]
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = input
            .get("todos")
            .ok_or_else(|| ToolError::missing_field("todos"))?;

        let outcome = match parse_records(raw) {
            Ok(records) => {
                let mut list = self.list.lock().await;
                list.write(records).map(|()| list.clone())
            }
            Err(rejection) => Err(rejection),
        };

        match outcome {
            Ok(list) => {
                let items = list.items();
                let count = |status| items.iter().filter(|r| r.status == status).count();
                Ok(ToolResult::success(format!(
                    "Todos have been modified successfully. {} total: {} pending, {} in progress, {} completed.",
                    items.len(),
                    count(TodoStatus::Pending),
                    count(TodoStatus::InProgress),
                    count(TodoStatus::Completed),
                ))
                .with_metadata(json!({ "todos": list.to_json() })))
            }
            Err(rejection) => Ok(ToolResult::error(format!("Error: {rejection}"))
                .with_metadata(json!({ "rejected": true, "reason": rejection.to_string() }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, status: TodoStatus) -> TaskRecord {
        TaskRecord {
            content: format!("task {id}"),
            status,
            priority: TodoPriority::Medium,
            id: id.to_string(),
        }
    }

    #[test]
    fn two_in_progress_records_are_rejected_and_list_kept() {
        let mut list = TodoList::new();
        list.write(vec![record("a", TodoStatus::InProgress)])
            .expect("first write");
        let before = list.clone();

        let err = list
            .write(vec![
                record("a", TodoStatus::InProgress),
                record("b", TodoStatus::InProgress),
            ])
            .unwrap_err();
        assert_eq!(err, TaskListRejection::MultipleInProgress { count: 2 });
        assert_eq!(list, before);
    }

    #[test]
    fn write_replaces_rather_than_merges() {
        let mut list = TodoList::new();
        list.write(vec![record("a", TodoStatus::Pending), record("b", TodoStatus::Pending)])
            .expect("write");
        list.write(vec![record("c", TodoStatus::Completed)])
            .expect("write");
        let ids: Vec<_> = list.items().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn empty_ids_receive_fresh_uuids() {
        let mut list = TodoList::new();
        list.write(vec![record("", TodoStatus::Pending), record(" ", TodoStatus::Pending)])
            .expect("write");
        let ids: Vec<_> = list.items().iter().map(|r| r.id.clone()).collect();
        assert_ne!(ids[0], ids[1]);
        for id in ids {
            assert!(Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
        }
    }

    #[test]
    fn parse_rejects_unknown_status() {
        let raw = json!([{ "content": "x", "status": "doing", "priority": "high", "id": "1" }]);
        let err = parse_records(&raw).unwrap_err();
        assert_eq!(
            err,
            TaskListRejection::InvalidStatus {
                index: 1,
                value: "doing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn tool_updates_shared_list() {
        let shared = new_shared_todo_list();
        let tool = TodoWriteTool::new(shared.clone());
        let ctx = ToolContext::new("/tmp");

        let result = tool
            .execute(
                json!({"todos": [
                    {"content": "Implement auth", "status": "in_progress", "priority": "high", "id": "1"},
                    {"content": "Write tests", "status": "pending", "priority": "low", "id": "2"}
                ]}),
                &ctx,
            )
            .await
            .expect("execute");
        assert!(result.success);
        assert!(result.content.contains("2 total"));
        assert_eq!(shared.lock().await.items().len(), 2);
    }

    #[tokio::test]
    async fn tool_reports_rejection_without_touching_state() {
        let shared = new_shared_todo_list();
        let tool = TodoWriteTool::new(shared.clone());
        let ctx = ToolContext::new("/tmp");

        let result = tool
            .execute(
                json!({"todos": [
                    {"content": "a", "status": "in_progress", "priority": "high", "id": "1"},
                    {"content": "b", "status": "in_progress", "priority": "high", "id": "2"}
                ]}),
                &ctx,
            )
            .await
            .expect("execute");
        assert!(!result.success);
        assert!(result.content.contains("Only one task"));
        assert!(shared.lock().await.is_empty());
    }
}
