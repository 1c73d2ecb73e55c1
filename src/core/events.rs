//! Events emitted by the orchestrator to the front end.
//!
//! These flow over an unbounded channel so the agent loop never waits on rendering,
//! except for approval requests, which carry a reply channel.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::tools::spec::ToolResult;
use crate::tools::todo::TodoList;

use super::approval::{ApprovalDecision, ApprovalRequest};
use super::engine::AgentRole;

#[derive(Debug)]
pub enum Event {
    // === Streaming Events ===
    /// The agent is about to call the model.
    StepStarted { agent: AgentRole, step: u32 },

    /// Incremental assistant text.
    MessageDelta { content: String },

    /// The assistant message for this step is complete.
    MessageComplete,

    // === Tool Events ===
    /// The model requested a tool; approval follows.
    ToolCallStarted {
        id: String,
        name: String,
        input: Value,
    },

    /// Ask the human. The orchestrator waits on `reply`.
    ApprovalRequired {
        request: ApprovalRequest,
        reply: oneshot::Sender<ApprovalDecision>,
    },

    ToolCallRejected { id: String, name: String },

    ToolCallComplete {
        id: String,
        name: String,
        result: ToolResult,
    },

    /// The task list was replaced.
    TodosUpdated { list: TodoList },

    // === System Events ===
    Error { message: String, recoverable: bool },

    Status { message: String },
}

impl Event {
    /// Create a new error event
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Event::Error {
            message: message.into(),
            recoverable,
        }
    }

    /// Create a new status event
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }
}
