//! The agent loop: stream a model step, run the requested tools one at a time
//! behind approval, feed the results back, repeat until the model answers in text.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{DEFAULT_MAX_STEPS, DEFAULT_MAX_TOKENS};
use crate::llm_client::LlmClient;
use crate::logging;
use crate::models::{Message, MessageRequest, ToolInvocationRequest, Usage};
use crate::prompts::{
    EMPTY_TODO_REMINDER, GENERAL_REMINDER, IDENTITY_PROMPT, todo_changed_reminder,
};
use crate::tools::registry::{ConfigurationError, ToolRegistry, rejection_result};
use crate::tools::todo::{SharedTodoList, TODO_WRITE_TOOL_NAME};

use super::approval::{ApprovalDecision, ApprovalRequest, Approver};
use super::events::Event;
use super::stream::{AssembledTurn, MessageAccumulator, StreamUpdate};

// === Types ===

/// Which tool set and prompt an orchestrator runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Main,
    SubAgent,
}

impl AgentRole {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AgentRole::Main => "MAIN AGENT",
            AgentRole::SubAgent => "SUB AGENT",
        }
    }
}

/// Configuration for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model identifier to use for responses.
    pub model: String,
    /// Workspace root for tool execution and file operations.
    pub workspace: PathBuf,
    /// Output token cap per model step.
    pub max_tokens: u32,
    /// Maximum number of model steps per query before stopping.
    pub max_steps: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            workspace: PathBuf::from("."),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// Where the conversation is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    AwaitingInput,
    Reasoning,
    AwaitingApproval,
    Executing,
    Done,
}

pub struct Orchestrator {
    role: AgentRole,
    config: OrchestratorConfig,
    client: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    approver: Arc<dyn Approver>,
    /// Only agents that carry the todo tool see or update the task list.
    todos: Option<SharedTodoList>,
    history: Vec<Message>,
    events: Option<mpsc::UnboundedSender<Event>>,
    state: AgentState,
    usage: Usage,
}

impl Orchestrator {
    /// Build an orchestrator whose history starts with the identity line, the role prompt,
    /// and the general reminder.
    pub fn new(
        role: AgentRole,
        config: OrchestratorConfig,
        client: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        approver: Arc<dyn Approver>,
        system_prompt: String,
    ) -> Self {
        let history = vec![
            Message::system(IDENTITY_PROMPT),
            Message::system(system_prompt),
            Message::user(GENERAL_REMINDER.trim()),
        ];
        Self {
            role,
            config,
            client,
            registry,
            approver,
            todos: None,
            history,
            events: None,
            state: AgentState::AwaitingInput,
            usage: Usage::default(),
        }
    }

    #[must_use]
    pub fn with_todos(mut self, todos: SharedTodoList) -> Self {
        self.todos = Some(todos);
        self
    }

    /// Stream progress to a front end. Agents without a sender run silently.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn role(&self) -> AgentRole {
        self.role
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Tokens reported by the model across every step so far.
    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    #[must_use]
    pub fn tool_names(&self) -> Vec<&'static str> {
        self.registry.names()
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Append the user query, plus the empty-list reminder when the task list is empty.
    pub async fn start(&mut self, query: &str) {
        self.history.push(Message::user(query));
        if let Some(todos) = &self.todos
            && todos.lock().await.is_empty()
        {
            self.history.push(Message::user(EMPTY_TODO_REMINDER.trim()));
        }
        self.state = AgentState::Reasoning;
    }

    /// One model step over the full history.
    ///
    /// The assistant message is appended only when it has text or tool calls.
    pub async fn reason(&mut self) -> Result<AssembledTurn> {
        self.state = AgentState::Reasoning;
        let request = MessageRequest {
            model: self.config.model.clone(),
            messages: self.history.clone(),
            max_tokens: self.config.max_tokens,
            tools: Some(self.registry.to_api_tools()),
            stream: Some(true),
            temperature: None,
        };

        let mut stream = self.client.create_message_stream(request).await?;
        let mut accumulator = MessageAccumulator::new();
        while let Some(event) = stream.next().await {
            match accumulator.apply(event?) {
                Some(StreamUpdate::Text(content)) => self.emit(Event::MessageDelta { content }),
                Some(StreamUpdate::ToolStarted { name, .. }) => {
                    tracing::debug!(agent = self.role.label(), tool = %name, "tool call streaming");
                }
                None => {}
            }
        }

        let turn = accumulator.finalize();
        self.usage.input_tokens += turn.usage.input_tokens;
        self.usage.output_tokens += turn.usage.output_tokens;
        if let Some(message) = &turn.message {
            self.history.push(message.clone());
        }
        self.emit(Event::MessageComplete);
        Ok(turn)
    }

    /// Run the requested tools sequentially, in order.
    ///
    /// An unknown tool name aborts the batch with [`ConfigurationError`]. A rejected call gets a
    /// terminal rejection result and is not retried.
    pub async fn act(&mut self, requests: Vec<ToolInvocationRequest>) -> Result<(), ConfigurationError> {
        let mut todos_changed = false;

        for request in requests {
            let tool = self.registry.resolve(&request.name)?;
            self.emit(Event::ToolCallStarted {
                id: request.id.clone(),
                name: request.name.clone(),
                input: request.input.clone(),
            });

            self.state = AgentState::AwaitingApproval;
            let decision = self
                .approver
                .decide(ApprovalRequest {
                    agent: self.role,
                    tool_name: request.name.clone(),
                    input: request.input.clone(),
                })
                .await;

            let result = match decision {
                ApprovalDecision::Rejected => {
                    logging::info(format!(
                        "{} tool '{}' rejected by user",
                        self.role.label(),
                        request.name
                    ));
                    self.emit(Event::ToolCallRejected {
                        id: request.id.clone(),
                        name: request.name.clone(),
                    });
                    rejection_result(&request.name, &request.input)
                }
                ApprovalDecision::Approved => {
                    self.state = AgentState::Executing;
                    let result = self.registry.execute(tool.name(), request.input).await?;
                    if request.name == TODO_WRITE_TOOL_NAME && result.success {
                        todos_changed = true;
                    }
                    self.emit(Event::ToolCallComplete {
                        id: request.id.clone(),
                        name: request.name.clone(),
                        result: result.clone(),
                    });
                    result
                }
            };

            self.history
                .push(Message::tool_result(request.id, result.content));
        }

        // Tool results must stay contiguous after the assistant message, so the reminder
        // follows the whole batch.
        if todos_changed && let Some(todos) = &self.todos {
            let list = todos.lock().await.clone();
            self.history.push(Message::user(todo_changed_reminder(&list)));
            self.emit(Event::TodosUpdated { list });
        }
        self.state = AgentState::Reasoning;
        Ok(())
    }

    /// Answer one query: reason, act on any tool calls, and repeat until the model replies
    /// without tool calls. Returns the final text.
    pub async fn run(&mut self, query: &str) -> Result<String> {
        self.start(query).await;

        let mut last_text = String::new();
        for step in 1..=self.config.max_steps {
            self.emit(Event::StepStarted {
                agent: self.role,
                step,
            });
            let turn = match self.reason().await {
                Ok(turn) => turn,
                Err(err) => {
                    self.emit(Event::error(err.to_string(), false));
                    self.state = AgentState::Done;
                    return Err(err);
                }
            };
            if turn.tool_calls.is_empty() {
                self.state = AgentState::Done;
                return Ok(turn.text);
            }
            if !turn.text.is_empty() {
                last_text = turn.text;
            }
            if let Err(err) = self.act(turn.tool_calls).await {
                self.emit(Event::error(err.to_string(), false));
                self.state = AgentState::Done;
                return Err(err.into());
            }
        }

        logging::warn(format!(
            "{} stopped after {} steps",
            self.role.label(),
            self.config.max_steps
        ));
        self.emit(Event::status("Reached maximum steps"));
        self.state = AgentState::Done;
        Ok(last_text)
    }
}

/// Short preview of tool arguments for display.
#[must_use]
pub fn summarize_input(input: &Value, limit: usize) -> String {
    let text = input.to_string();
    if text.chars().count() <= limit {
        return text;
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::StreamEventBox;
    use crate::models::{ContentBlockStart, Delta, MessageDelta, MessageResponse, Role, StreamEvent};
    use crate::tools::ToolRegistryBuilder;
    use crate::tools::spec::ToolContext;
    use crate::tools::todo::new_shared_todo_list;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Text(&'static str),
        Tools(Vec<(&'static str, &'static str, Value)>),
    }

    /// Plays back canned model steps and records every request.
    struct ScriptedClient {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<MessageRequest>>,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }
    }

    fn events_for(step: Step) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::MessageStart {
            message: MessageResponse {
                id: "m".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: "scripted".to_string(),
                stop_reason: None,
                usage: Usage::default(),
            },
        }];
        match step {
            Step::Text(text) => {
                events.push(StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlockStart::Text {
                        text: String::new(),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: Delta::TextDelta {
                        text: text.to_string(),
                    },
                });
            }
            Step::Tools(calls) => {
                for (index, (id, name, input)) in (0u32..).zip(calls) {
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlockStart::ToolUse {
                            id: id.to_string(),
                            name: name.to_string(),
                            input: json!({}),
                        },
                    });
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    });
                }
            }
        }
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta::default(),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 2,
            }),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn create_message(&self, _request: MessageRequest) -> Result<MessageResponse> {
            anyhow::bail!("not scripted")
        }

        async fn create_message_stream(&self, request: MessageRequest) -> Result<StreamEventBox> {
            self.requests.lock().expect("requests lock").push(request);
            let step = self
                .steps
                .lock()
                .expect("steps lock")
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
            let events = events_for(step).into_iter().map(Ok);
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    struct FixedApprover {
        decision: ApprovalDecision,
        seen: Mutex<Vec<String>>,
    }

    impl FixedApprover {
        fn new(decision: ApprovalDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Approver for FixedApprover {
        async fn decide(&self, request: ApprovalRequest) -> ApprovalDecision {
            self.seen.lock().expect("seen lock").push(request.tool_name);
            self.decision
        }
    }

    fn orchestrator(
        client: Arc<ScriptedClient>,
        approver: Arc<FixedApprover>,
        workspace: &std::path::Path,
    ) -> Orchestrator {
        let todos = new_shared_todo_list();
        let registry = ToolRegistryBuilder::new()
            .with_file_tools()
            .with_todo_tool(todos.clone())
            .build(ToolContext::new(workspace));
        Orchestrator::new(
            AgentRole::Main,
            OrchestratorConfig {
                model: "scripted".to_string(),
                workspace: workspace.to_path_buf(),
                max_steps: 5,
                ..Default::default()
            },
            client,
            registry,
            approver,
            "system prompt".to_string(),
        )
        .with_todos(todos)
    }

    #[tokio::test]
    async fn plain_answer_ends_the_loop_without_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(vec![Step::Text("All done.")]);
        let approver = FixedApprover::new(ApprovalDecision::Approved);
        let mut agent = orchestrator(client.clone(), approver.clone(), dir.path());

        let answer = agent.run("hello").await.expect("run");

        assert_eq!(answer, "All done.");
        assert_eq!(client.request_count(), 1);
        assert!(approver.seen.lock().expect("seen lock").is_empty());
        assert_eq!(agent.state(), AgentState::Done);
        let last = agent.history().last().expect("history");
        assert_eq!(last, &Message::assistant("All done."));
    }

    #[tokio::test]
    async fn start_adds_empty_todo_reminder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(Vec::new());
        let mut agent = orchestrator(
            client,
            FixedApprover::new(ApprovalDecision::Approved),
            dir.path(),
        );

        agent.start("plan something").await;

        let history = agent.history();
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1].role, Role::System);
        assert!(history[2].text_content().contains("<system-reminder>"));
        assert_eq!(history[3], Message::user("plan something"));
        assert_eq!(history[4].text_content(), EMPTY_TODO_REMINDER.trim());
    }

    #[tokio::test]
    async fn rejected_tool_gets_terminal_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("secret.txt");
        std::fs::write(&target, "data").expect("write");
        let input = json!({"file_path": target.to_string_lossy()});
        let client = ScriptedClient::new(vec![
            Step::Tools(vec![("call_1", "read_tool", input.clone())]),
            Step::Text("Understood."),
        ]);
        let approver = FixedApprover::new(ApprovalDecision::Rejected);
        let mut agent = orchestrator(client.clone(), approver, dir.path());

        let answer = agent.run("read it").await.expect("run");

        assert_eq!(answer, "Understood.");
        let tool_message = agent
            .history()
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool message");
        assert_eq!(
            tool_message.content[0],
            crate::models::ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: format!(
                    "Human rejected to run this tool 'read_tool' with arguments {input}, try different tool or different input"
                ),
            }
        );
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn tools_run_in_request_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes.txt");
        let client = ScriptedClient::new(vec![
            Step::Tools(vec![
                (
                    "c1",
                    "write_tool",
                    json!({"file_path": file.to_string_lossy(), "content": "one"}),
                ),
                ("c2", "read_tool", json!({"file_path": file.to_string_lossy()})),
            ]),
            Step::Text("ok"),
        ]);
        let approver = FixedApprover::new(ApprovalDecision::Approved);
        let mut agent = orchestrator(client, approver.clone(), dir.path());

        agent.run("write then read").await.expect("run");

        assert_eq!(
            *approver.seen.lock().expect("seen lock"),
            vec!["write_tool".to_string(), "read_tool".to_string()]
        );
        let results: Vec<String> = agent
            .history()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| match &m.content[0] {
                crate::models::ContentBlock::ToolResult { content, .. } => content.clone(),
                other => panic!("unexpected block {other:?}"),
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].starts_with("Successfully created file"));
        assert!(results[1].contains("     1|one"));
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(vec![Step::Tools(vec![(
            "c1",
            "task_tool",
            json!({}),
        )])]);
        let approver = FixedApprover::new(ApprovalDecision::Approved);
        let mut agent = orchestrator(client, approver.clone(), dir.path());

        let err = agent.run("delegate").await.expect_err("unknown tool");
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::UnknownTool { name }) if name == "task_tool"
        ));
        assert!(approver.seen.lock().expect("seen lock").is_empty());
    }

    #[tokio::test]
    async fn todo_write_appends_changed_reminder_after_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let todos = json!({"todos": [
            {"content": "investigate", "status": "in_progress", "priority": "high", "id": "1"}
        ]});
        let client = ScriptedClient::new(vec![
            Step::Tools(vec![("c1", TODO_WRITE_TOOL_NAME, todos)]),
            Step::Text("tracking"),
        ]);
        let mut agent = orchestrator(
            client,
            FixedApprover::new(ApprovalDecision::Approved),
            dir.path(),
        );

        agent.run("track work").await.expect("run");

        let history = agent.history();
        let tool_index = history
            .iter()
            .position(|m| m.role == Role::Tool)
            .expect("tool message");
        let reminder = history[tool_index + 1].text_content();
        assert_eq!(history[tool_index + 1].role, Role::User);
        assert!(reminder.contains("\"content\":\"investigate\""));
        assert!(reminder.starts_with("<system-reminder>"));
    }

    #[tokio::test]
    async fn step_limit_stops_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ls = || Step::Tools(vec![("c", "ls_tool", json!({"path": "/"}))]);
        let client = ScriptedClient::new(vec![ls(), ls(), ls(), ls(), ls(), ls()]);
        let mut agent = orchestrator(
            client.clone(),
            FixedApprover::new(ApprovalDecision::Rejected),
            dir.path(),
        );

        let answer = agent.run("loop forever").await.expect("run");
        assert_eq!(answer, "");
        assert_eq!(client.request_count(), 5);
        assert_eq!(agent.usage().input_tokens, 50);
    }

    #[test]
    fn long_inputs_are_previewed() {
        let input = json!({"content": "x".repeat(100)});
        let preview = summarize_input(&input, 20);
        assert_eq!(preview.chars().count(), 23);
        assert!(preview.ends_with("..."));
    }
}
