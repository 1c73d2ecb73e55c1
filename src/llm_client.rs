//! Model-service boundary: the `LlmClient` trait and its error type.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::models::{MessageRequest, MessageResponse, StreamEvent};

/// Pinned, boxed stream of streaming events.
pub type StreamEventBox = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model used when a request leaves the choice to the client.
    fn model(&self) -> &str;

    async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse>;

    async fn create_message_stream(&self, request: MessageRequest) -> Result<StreamEventBox>;
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Classify a non-success HTTP response.
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().to_string()
        };
        match status {
            401 | 403 => Self::AuthenticationError(message),
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            408 | 504 => Self::Timeout(retry_after.unwrap_or_default()),
            400..=499 => Self::InvalidRequest { status, message },
            500..=599 => Self::ServerError { status, message },
            _ => Self::Other(message),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::NetworkError(_) | Self::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::default())
        } else if err.is_decode() {
            Self::ParseError(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::NetworkError(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}
