//! Assembles streamed model events into one finalized assistant message.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::logging;
use crate::models::{
    ContentBlock, ContentBlockStart, Delta, Message, Role, StreamEvent, ToolInvocationRequest,
    Usage,
};

/// Something the front end can show while the stream is still open.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Text(String),
    ToolStarted { id: String, name: String },
}

#[derive(Debug)]
enum Block {
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        initial_input: Value,
        buffer: String,
    },
}

/// The result of one model step.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTurn {
    /// `None` when the model produced neither text nor tool calls.
    pub message: Option<Message>,
    pub text: String,
    pub tool_calls: Vec<ToolInvocationRequest>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// Start with [`MessageAccumulator::new`], feed every event to [`apply`](Self::apply),
/// then [`finalize`](Self::finalize).
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    text: String,
    thinking: String,
    blocks: BTreeMap<u32, Block>,
    stop_reason: Option<String>,
    usage: Usage,
}

impl MessageAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) -> Option<StreamUpdate> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.usage = message.usage;
                None
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlockStart::Text { text } => {
                    self.blocks.insert(index, Block::Text);
                    self.push_text(text)
                }
                ContentBlockStart::Thinking { thinking } => {
                    self.blocks.insert(index, Block::Thinking);
                    self.thinking.push_str(&thinking);
                    None
                }
                ContentBlockStart::ToolUse { id, name, input } => {
                    self.blocks.insert(
                        index,
                        Block::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            initial_input: input,
                            buffer: String::new(),
                        },
                    );
                    Some(StreamUpdate::ToolStarted { id, name })
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => self.push_text(text),
                Delta::ThinkingDelta { thinking } => {
                    self.thinking.push_str(&thinking);
                    None
                }
                Delta::InputJsonDelta { partial_json } => {
                    match self.blocks.get_mut(&index) {
                        Some(Block::ToolUse { buffer, .. }) => buffer.push_str(&partial_json),
                        _ => logging::warn(format!(
                            "Dropping tool argument delta for unknown block {index}"
                        )),
                    }
                    None
                }
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    self.usage = usage;
                }
                None
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::MessageStop | StreamEvent::Ping => {
                None
            }
        }
    }

    fn push_text(&mut self, text: String) -> Option<StreamUpdate> {
        if text.is_empty() {
            return None;
        }
        self.text.push_str(&text);
        Some(StreamUpdate::Text(text))
    }

    /// Close the stream. Tool calls keep their stream order.
    #[must_use]
    pub fn finalize(self) -> AssembledTurn {
        let tool_calls: Vec<ToolInvocationRequest> = self
            .blocks
            .into_values()
            .filter_map(|block| match block {
                Block::ToolUse {
                    id,
                    name,
                    initial_input,
                    buffer,
                } => Some(ToolInvocationRequest {
                    input: resolve_input(&name, initial_input, &buffer),
                    id,
                    name,
                }),
                Block::Text | Block::Thinking => None,
            })
            .collect();

        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: self.thinking,
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        content.extend(tool_calls.iter().map(|call| ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        }));

        let message = (!self.text.is_empty() || !tool_calls.is_empty()).then(|| Message {
            role: Role::Assistant,
            content,
        });

        AssembledTurn {
            message,
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

fn resolve_input(name: &str, initial: Value, buffer: &str) -> Value {
    if buffer.trim().is_empty() {
        return if initial.is_null() { json!({}) } else { initial };
    }
    match parse_tool_input(buffer) {
        Some(value) => value,
        None => {
            logging::warn(format!(
                "Tool '{name}' received malformed arguments from model: '{buffer}'"
            ));
            json!({})
        }
    }
}

/// Parse streamed tool arguments, tolerating code fences and double-encoded JSON.
fn parse_tool_input(buffer: &str) -> Option<Value> {
    let trimmed = buffer.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(inner)) => serde_json::from_str(&inner).ok(),
        Ok(value) => Some(value),
        Err(_) => {
            let unfenced: String = trimmed
                .lines()
                .filter(|line| !line.trim_start().starts_with("```"))
                .collect::<Vec<_>>()
                .join("\n");
            serde_json::from_str(unfenced.trim()).ok()
        }
    }
}
