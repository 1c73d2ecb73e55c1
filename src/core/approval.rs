//! Human approval gate. Every tool invocation needs one decision.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::engine::AgentRole;
use super::events::Event;

pub const APPROVAL_PROMPT: &str = "Do you want to execute this tool? (y/n): ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// What the human is asked to approve.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub agent: AgentRole,
    pub tool_name: String,
    pub input: Value,
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Anything other than `y` or `yes` (trimmed, any case) rejects.
#[must_use]
pub fn parse_decision(answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::Approved,
        _ => ApprovalDecision::Rejected,
    }
}

/// Forwards approval requests to the front end over the event channel and waits for the answer.
///
/// Sharing the channel with streamed output keeps prompts ordered after the text that led to
/// them. A dropped reply counts as a rejection.
#[derive(Clone)]
pub struct ChannelApprover {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelApprover {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn decide(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (reply, answer) = oneshot::channel();
        if self
            .tx
            .send(Event::ApprovalRequired { request, reply })
            .is_err()
        {
            return ApprovalDecision::Rejected;
        }
        answer.await.unwrap_or(ApprovalDecision::Rejected)
    }
}
