//! Tool contract shared by every tool the agent can call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::ledger::FileAccessLedger;

// === Types ===

/// Coarse capability tags used for display and tool-set filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    ReadOnly,
    WritesFiles,
    ExecutesCode,
    Network,
    Delegates,
}

/// Result returned to the model after a tool runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: None,
        }
    }

    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Errors a tool can raise. Each maps onto one category of the error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("{message}")]
    Precondition { message: String },

    #[error("Path does not exist: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Timed out after {seconds}s")]
    Timeout {
        seconds: u64,
        partial_output: Option<String>,
    },

    #[error("{message}")]
    ExecutionFailed { message: String },
}

impl ToolError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Classify an I/O error raised while touching `path`.
    #[must_use]
    pub fn from_io(err: &std::io::Error, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(path),
            std::io::ErrorKind::PermissionDenied => {
                Self::permission_denied(path.display().to_string())
            }
            _ => Self::execution_failed(format!("{}: {err}", path.display())),
        }
    }
}

/// Per-invocation environment handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory used when a tool takes an optional search root.
    pub workspace: PathBuf,
    /// Process-wide record of files the agents have read.
    pub ledger: FileAccessLedger,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self::with_ledger(workspace, FileAccessLedger::new())
    }

    pub fn with_ledger(workspace: impl Into<PathBuf>, ledger: FileAccessLedger) -> Self {
        Self {
            workspace: workspace.into(),
            ledger,
        }
    }

    /// File tools only accept absolute paths.
    pub fn require_absolute(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let path = PathBuf::from(raw);
        if raw.trim().is_empty() || !path.is_absolute() {
            return Err(ToolError::invalid_input(format!(
                "Path must be absolute, got relative path: {raw}"
            )));
        }
        Ok(path)
    }

    /// Resolve an optional search root, defaulting to the workspace.
    pub fn search_root(&self, raw: Option<&str>) -> PathBuf {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => {
                let path = PathBuf::from(value);
                if path.is_absolute() {
                    path
                } else {
                    self.workspace.join(path)
                }
            }
            None => self.workspace.clone(),
        }
    }
}

/// A tool the model can invoke.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the argument object.
    fn input_schema(&self) -> Value;

    fn capabilities(&self) -> Vec<ToolCapability> {
        Vec::new()
    }

    fn is_read_only(&self) -> bool {
        self.capabilities().contains(&ToolCapability::ReadOnly)
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

// === Input helpers ===

pub fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::missing_field(key))
}

#[must_use]
pub fn optional_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

#[must_use]
pub fn optional_u64(input: &Value, key: &str, default: u64) -> u64 {
    input.get(key).and_then(Value::as_u64).unwrap_or(default)
}

#[must_use]
pub fn optional_opt_u64(input: &Value, key: &str) -> Option<u64> {
    input.get(key).and_then(Value::as_u64)
}

#[must_use]
pub fn optional_bool(input: &Value, key: &str, default: bool) -> bool {
    input.get(key).and_then(Value::as_bool).unwrap_or(default)
}
