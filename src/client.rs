//! HTTP client for OpenAI-compatible chat-completions endpoints.
//!
//! Requests go to `{base_url}/chat/completions`. Streaming responses are parsed from
//! server-sent events into the crate's `StreamEvent` representation.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::{Value, json};

use crate::config::{Config, RetryPolicy};
use crate::llm_client::{LlmClient, LlmError, StreamEventBox};
use crate::logging;
use crate::models::{
    ContentBlock, ContentBlockStart, Delta, Message, MessageDelta, MessageRequest, MessageResponse,
    Role, StreamEvent, Tool, Usage,
};

/// Encode a tool name into the `[A-Za-z0-9_-]` alphabet accepted by function-calling APIs.
pub(crate) fn to_api_tool_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else if ch == '-' {
            out.push_str("--");
        } else {
            out.push_str(&format!("-x{:06X}-", ch as u32));
        }
    }
    out
}

pub(crate) fn from_api_tool_name(name: &str) -> String {
    let mut out = String::new();
    let mut iter = name.chars().peekable();
    while let Some(ch) = iter.next() {
        if ch != '-' {
            out.push(ch);
            continue;
        }
        match iter.peek().copied() {
            Some('-') => {
                iter.next();
                out.push('-');
            }
            Some('x') => {
                iter.next();
                let hex: String = iter.by_ref().take(6).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => {
                        if iter.peek() == Some(&'-') {
                            iter.next();
                        }
                        out.push(decoded);
                    }
                    None => {
                        out.push_str("-x");
                        out.push_str(&hex);
                    }
                }
            }
            _ => out.push('-'),
        }
    }
    out
}

// === Types ===

/// Client for OpenAI-compatible chat-completions APIs.
#[must_use]
#[derive(Clone)]
pub struct OpenAiCompatClient {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    default_model: String,
}

impl OpenAiCompatClient {
    /// Create a client from resolved configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.api_key()?;
        let base_url = config.base_url();
        let retry = config.retry_policy();
        let default_model = config.model();

        logging::info(format!("Model endpoint: {base_url} (model {default_model})"));
        logging::info(format!(
            "Retry policy: enabled={}, max_retries={}, initial_delay={}s, max_delay={}s",
            retry.enabled, retry.max_retries, retry.initial_delay, retry.max_delay
        ));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .context("API key contains characters not allowed in a header")?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            retry,
            default_model,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &MessageRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let mut body = json!({
            "model": model,
            "messages": build_chat_messages(&request.messages),
            "max_tokens": request.max_tokens,
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
            body["tools"] = json!(tools.iter().map(tool_to_chat).collect::<Vec<_>>());
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = self.endpoint();
        let response =
            send_with_retry(&self.retry, || self.http_client.post(&url).json(body)).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(LlmError::from_status(status.as_u16(), &text, retry_after).into())
    }
}

// === Trait Implementations ===

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.default_model
    }

    async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse> {
        let body = self.request_body(&request, false);
        let response = self.post(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|err| anyhow::Error::from(LlmError::from(err)))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|err| LlmError::ParseError(format!("chat completion JSON: {err}")))?;
        parse_chat_message(&value)
    }

    async fn create_message_stream(&self, request: MessageRequest) -> Result<StreamEventBox> {
        let body = self.request_body(&request, true);
        let response = self.post(&body).await?;
        let model = body["model"].as_str().unwrap_or_default().to_string();
        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            yield Ok(StreamEvent::MessageStart {
                message: MessageResponse {
                    id: String::new(),
                    role: Role::Assistant,
                    content: Vec::new(),
                    model,
                    stop_reason: None,
                    usage: Usage::default(),
                },
            });

            let mut state = SseState::default();
            let mut pending = Vec::new();
            let mut data = String::new();
            let mut byte_stream = std::pin::pin!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        yield Err(anyhow::Error::from(LlmError::NetworkError(format!(
                            "stream read failed: {err}"
                        ))));
                        break;
                    }
                };
                pending.extend_from_slice(&chunk);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\n', '\r']);

                    if line.is_empty() {
                        let event = std::mem::take(&mut data);
                        for parsed in state.consume(&event) {
                            yield Ok(parsed);
                        }
                        continue;
                    }
                    // Other SSE fields (event:, id:, retry:) carry nothing we use.
                    if let Some(payload) = line.strip_prefix("data:") {
                        data.push_str(payload.trim_start());
                    }
                }
            }

            for parsed in state.consume(&data) {
                yield Ok(parsed);
            }
            for parsed in state.close_all() {
                yield Ok(parsed);
            }
            yield Ok(StreamEvent::MessageStop);
        };

        Ok(Box::pin(stream))
    }
}

// === Chat Completions Helpers ===

/// Convert conversation history into chat-completions messages.
///
/// Tool results only survive when the assistant message directly before them
/// requested that call, and assistant tool calls whose results are missing are
/// downgraded to plain assistant text.
fn build_chat_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut pending_tool_calls: HashSet<String> = HashSet::new();

    for message in messages {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results: Vec<(String, Value)> = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text.as_str()),
                ContentBlock::Thinking { .. } => {}
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push((
                        id.clone(),
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": to_api_tool_name(name),
                                "arguments": input.to_string(),
                            }
                        }),
                    ));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => tool_results.push((
                    tool_use_id.clone(),
                    json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    }),
                )),
            }
        }
        let content = text_parts.join("\n");

        match message.role {
            Role::System => {
                if !content.trim().is_empty() {
                    out.push(json!({ "role": "system", "content": content }));
                }
            }
            Role::User => {
                if !content.trim().is_empty() {
                    out.push(json!({ "role": "user", "content": content }));
                }
            }
            Role::Assistant => {
                let mut msg = json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { json!(content) },
                });
                if tool_calls.is_empty() {
                    pending_tool_calls.clear();
                } else {
                    pending_tool_calls = tool_calls.iter().map(|(id, _)| id.clone()).collect();
                    msg["tool_calls"] =
                        Value::Array(tool_calls.into_iter().map(|(_, call)| call).collect());
                }
                out.push(msg);
            }
            Role::Tool => {}
        }

        if !tool_results.is_empty() {
            if pending_tool_calls.is_empty() {
                logging::warn("Dropping tool results without matching tool_calls");
            }
            for (tool_id, tool_msg) in tool_results {
                if pending_tool_calls.remove(&tool_id) {
                    out.push(tool_msg);
                } else if !pending_tool_calls.is_empty() {
                    logging::warn(format!(
                        "Dropping tool result for unknown tool_call_id: {tool_id}"
                    ));
                }
            }
        } else if !matches!(message.role, Role::Assistant | Role::System) {
            pending_tool_calls.clear();
        }
    }

    strip_unanswered_tool_calls(&mut out);
    out
}

/// The API rejects an assistant message whose tool calls are not all answered
/// before the next assistant turn. Drop the calls and their partial results.
fn strip_unanswered_tool_calls(out: &mut Vec<Value>) {
    let role_of = |value: &Value| value.get("role").and_then(Value::as_str).map(str::to_string);

    let mut i = 0;
    while i < out.len() {
        let expected: HashSet<String> = out[i]
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| c.get("id").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if expected.is_empty() {
            i += 1;
            continue;
        }

        let mut found = HashSet::new();
        let mut scan = i + 1;
        while scan < out.len() && role_of(&out[scan]).as_deref() != Some("assistant") {
            if let Some(id) = out[scan].get("tool_call_id").and_then(Value::as_str) {
                found.insert(id.to_string());
            }
            scan += 1;
        }

        if !expected.is_subset(&found) {
            let missing: Vec<_> = expected.difference(&found).collect();
            logging::warn(format!(
                "Stripping unanswered tool_calls from assistant message (missing: {missing:?})"
            ));
            if let Some(obj) = out[i].as_object_mut() {
                obj.remove("tool_calls");
            }
            let mut j = scan;
            while j > i + 1 {
                j -= 1;
                let answers_stripped_call = out[j]
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| expected.contains(id));
                if answers_stripped_call {
                    out.remove(j);
                }
            }
            if out[i].get("content").is_some_and(Value::is_null) {
                out.remove(i);
                continue;
            }
        }
        i += 1;
    }
}

fn tool_to_chat(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": to_api_tool_name(&tool.name),
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

fn parse_chat_message(payload: &Value) -> Result<MessageResponse> {
    let missing = |what: &str| LlmError::ParseError(format!("chat completion missing {what}"));

    let choice = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| missing("choices"))?;
    let message = choice.get("message").ok_or_else(|| missing("message"))?;

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str)
        && !text.trim().is_empty()
    {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }

    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let function = call.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("tool");
        let input = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into())))
            .unwrap_or_else(|| json!({}));

        content.push(ContentBlock::ToolUse {
            id: call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("tool_call")
                .to_string(),
            name: from_api_tool_name(name),
            input,
        });
    }

    Ok(MessageResponse {
        id: payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("chatcmpl")
            .to_string(),
        role: Role::Assistant,
        content,
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        stop_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: parse_usage(payload.get("usage")),
    })
}

fn parse_usage(usage: Option<&Value>) -> Usage {
    let tokens = |primary: &str, fallback: &str| {
        usage
            .and_then(|u| u.get(primary).or_else(|| u.get(fallback)))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    Usage {
        input_tokens: tokens("prompt_tokens", "input_tokens"),
        output_tokens: tokens("completion_tokens", "output_tokens"),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

// === SSE Chunk Parser ===

/// Block bookkeeping while translating chat-completion chunks into stream events.
#[derive(Debug, Default)]
struct SseState {
    next_index: u32,
    text_index: Option<u32>,
    /// Provider tool-call index -> our content block index.
    tool_blocks: BTreeMap<u32, u32>,
}

impl SseState {
    /// Translate one SSE `data:` payload.
    fn consume(&mut self, data: &str) -> Vec<StreamEvent> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => self.parse_chunk(&chunk),
            Err(err) => {
                logging::warn(format!("Skipping malformed stream chunk: {err}"));
                Vec::new()
            }
        }
    }

    fn parse_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            return events;
        };
        if choices.is_empty() {
            // Usage-only chunk sent last when include_usage is set.
            if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
                events.push(StreamEvent::MessageDelta {
                    delta: MessageDelta::default(),
                    usage: Some(parse_usage(Some(usage))),
                });
            }
            return events;
        }

        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                if let Some(text) = delta.get("content").and_then(Value::as_str)
                    && !text.is_empty()
                {
                    let index = self.text_block(&mut events);
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::TextDelta {
                            text: text.to_string(),
                        },
                    });
                }

                for call in delta
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    self.tool_call_delta(call, &mut events);
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                events.extend(self.close_all());
                events.push(StreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: Some(reason.to_string()),
                    },
                    usage: chunk
                        .get("usage")
                        .filter(|u| !u.is_null())
                        .map(|u| parse_usage(Some(u))),
                });
            }
        }

        events
    }

    fn text_block(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(index) = self.text_index {
            return index;
        }
        let index = self.allocate();
        self.text_index = Some(index);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::Text {
                text: String::new(),
            },
        });
        index
    }

    fn tool_call_delta(&mut self, call: &Value, events: &mut Vec<StreamEvent>) {
        let provider_index = call
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let function = call.get("function");

        let index = match self.tool_blocks.get(&provider_index) {
            Some(index) => *index,
            None => {
                if let Some(text_index) = self.text_index.take() {
                    events.push(StreamEvent::ContentBlockStop { index: text_index });
                }
                let index = self.allocate();
                self.tool_blocks.insert(provider_index, index);
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("call_{index}"), str::to_string);
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlockStart::ToolUse {
                        id,
                        name: from_api_tool_name(name),
                        input: json!({}),
                    },
                });
                index
            }
        };

        if let Some(args) = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            && !args.is_empty()
        {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: args.to_string(),
                },
            });
        }
    }

    /// Stop events for every block still open.
    fn close_all(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(index) = self.text_index.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        for (_, index) in std::mem::take(&mut self.tool_blocks) {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        events
    }

    fn allocate(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

// === Retry Helpers ===

/// Longest server-requested wait honoured before retrying.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        let requested_delay = match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let retry_after = parse_retry_after(response.headers());
                let classified = LlmError::from_status(status.as_u16(), "", retry_after);
                if !classified.is_retryable() || !policy.enabled || attempt >= policy.max_retries
                {
                    return Ok(response);
                }
                logging::warn(format!(
                    "Retryable HTTP {} (attempt {} of {})",
                    status.as_u16(),
                    attempt + 1,
                    policy.max_retries + 1
                ));
                retry_after
            }
            Err(err) => {
                let err = LlmError::from(err);
                if !err.is_retryable() || !policy.enabled || attempt >= policy.max_retries {
                    return Err(err.into());
                }
                logging::warn(format!(
                    "Request error: {} (attempt {} of {})",
                    err,
                    attempt + 1,
                    policy.max_retries + 1
                ));
                None
            }
        };

        let delay = requested_delay.map_or_else(
            || policy.delay_for_attempt(attempt),
            |wait| wait.min(MAX_RETRY_AFTER),
        );
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}
