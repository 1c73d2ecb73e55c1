//! Shared error taxonomy across client, tools, orchestrator, and CLI.

use crate::llm_client::LlmError;
use crate::tools::registry::ConfigurationError;
use crate::tools::spec::ToolError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Precondition,
    NotFound,
    Permission,
    Timeout,
    Configuration,
    Execution,
    Network,
    Authentication,
    RateLimit,
    Parse,
    Internal,
}

/// Severity hint for UI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }

    /// JSON form attached to failed tool results.
    #[must_use]
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::json!({ "error": self })
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<LlmError> for ErrorEnvelope {
    fn from(value: LlmError) -> Self {
        match value {
            LlmError::RateLimited { message, .. } => Self::new(
                ErrorCategory::RateLimit,
                ErrorSeverity::Warning,
                true,
                "llm_rate_limited",
                message,
            ),
            LlmError::ServerError { status, message } => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                format!("llm_server_{status}"),
                message,
            ),
            LlmError::NetworkError(message) => Self::new(
                ErrorCategory::Network,
                ErrorSeverity::Error,
                true,
                "llm_network_error",
                message,
            ),
            LlmError::Timeout(duration) => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                "llm_timeout",
                format!("Request timed out after {duration:?}"),
            ),
            LlmError::AuthenticationError(message) => Self::new(
                ErrorCategory::Authentication,
                ErrorSeverity::Critical,
                false,
                "llm_auth_error",
                message,
            ),
            LlmError::InvalidRequest { message, .. } => Self::new(
                ErrorCategory::Validation,
                ErrorSeverity::Error,
                false,
                "llm_invalid_request",
                message,
            ),
            LlmError::ParseError(message) => Self::new(
                ErrorCategory::Parse,
                ErrorSeverity::Error,
                false,
                "llm_parse_error",
                message,
            ),
            LlmError::Other(message) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                "llm_other",
                message,
            ),
        }
    }
}

impl From<ToolError> for ErrorEnvelope {
    fn from(value: ToolError) -> Self {
        let message = value.to_string();
        match value {
            ToolError::InvalidInput { .. } => Self::new(
                ErrorCategory::Validation,
                ErrorSeverity::Error,
                true,
                "tool_invalid_input",
                message,
            ),
            ToolError::MissingField { .. } => Self::new(
                ErrorCategory::Validation,
                ErrorSeverity::Error,
                true,
                "tool_missing_field",
                message,
            ),
            ToolError::Precondition { .. } => Self::new(
                ErrorCategory::Precondition,
                ErrorSeverity::Warning,
                true,
                "tool_precondition",
                message,
            ),
            ToolError::NotFound { .. } => Self::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Warning,
                true,
                "tool_not_found",
                message,
            ),
            ToolError::PermissionDenied { .. } => Self::new(
                ErrorCategory::Permission,
                ErrorSeverity::Error,
                false,
                "tool_permission_denied",
                message,
            ),
            ToolError::Timeout { .. } => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                false,
                "tool_timeout",
                message,
            ),
            ToolError::ExecutionFailed { .. } => Self::new(
                ErrorCategory::Execution,
                ErrorSeverity::Error,
                true,
                "tool_execution_failed",
                message,
            ),
        }
    }
}

impl From<&ConfigurationError> for ErrorEnvelope {
    fn from(value: &ConfigurationError) -> Self {
        Self::new(
            ErrorCategory::Configuration,
            ErrorSeverity::Critical,
            false,
            "configuration_error",
            value.to_string(),
        )
    }
}

/// Best-effort envelope for an application-level error chain.
#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorEnvelope {
    if let Some(llm) = err.downcast_ref::<LlmError>() {
        return ErrorEnvelope::from(llm.clone());
    }
    if let Some(config) = err.downcast_ref::<ConfigurationError>() {
        return ErrorEnvelope::from(config);
    }
    ErrorEnvelope::new(
        ErrorCategory::Internal,
        ErrorSeverity::Error,
        false,
        "internal",
        format!("{err:#}"),
    )
}
