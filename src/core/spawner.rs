//! Builds orchestrators and runs delegated sub-agents.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::llm_client::LlmClient;
use crate::logging;
use crate::prompts::{EnvironmentInfo, main_agent_prompt, sub_agent_prompt};
use crate::tools::ledger::FileAccessLedger;
use crate::tools::registry::{ToolRegistry, ToolRegistryBuilder};
use crate::tools::spec::ToolContext;
use crate::tools::todo::SharedTodoList;

use super::approval::Approver;
use super::engine::{AgentRole, Orchestrator, OrchestratorConfig};
use super::events::Event;

/// Everything needed to construct an agent. Cheap to clone; the ledger is shared by every
/// agent it builds.
#[derive(Clone)]
pub struct AgentFactory {
    client: Arc<dyn LlmClient>,
    approver: Arc<dyn Approver>,
    ledger: FileAccessLedger,
    config: OrchestratorConfig,
}

impl AgentFactory {
    pub fn new(
        client: Arc<dyn LlmClient>,
        approver: Arc<dyn Approver>,
        ledger: FileAccessLedger,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            approver,
            ledger,
            config,
        }
    }

    /// Tool set for a role. Sub-agents never carry delegation or the task list.
    pub fn registry_for(&self, role: AgentRole, todos: Option<SharedTodoList>) -> ToolRegistry {
        let mut builder = ToolRegistryBuilder::new()
            .with_file_tools()
            .with_search_tools()
            .with_shell_tools()
            .with_web_tools(Arc::clone(&self.client));
        if role == AgentRole::Main {
            builder = builder.with_task_tool(Spawner::new(self.clone()));
            if let Some(todos) = todos {
                builder = builder.with_todo_tool(todos);
            }
        }
        builder.build(ToolContext::with_ledger(
            self.config.workspace.clone(),
            self.ledger.clone(),
        ))
    }

    fn environment(&self) -> EnvironmentInfo {
        let model = if self.config.model.is_empty() {
            self.client.model()
        } else {
            &self.config.model
        };
        EnvironmentInfo::detect(&self.config.workspace, model)
    }

    pub fn build_main(
        &self,
        todos: SharedTodoList,
        events: Option<mpsc::UnboundedSender<Event>>,
    ) -> Orchestrator {
        let registry = self.registry_for(AgentRole::Main, Some(todos.clone()));
        let agent = Orchestrator::new(
            AgentRole::Main,
            self.config.clone(),
            Arc::clone(&self.client),
            registry,
            Arc::clone(&self.approver),
            main_agent_prompt(&self.environment()),
        )
        .with_todos(todos);
        match events {
            Some(tx) => agent.with_events(tx),
            None => agent,
        }
    }

    /// A fresh agent with no history beyond its prompts. It streams nothing to the front end
    /// but still asks for approval.
    pub fn build_sub_agent(&self) -> Orchestrator {
        Orchestrator::new(
            AgentRole::SubAgent,
            self.config.clone(),
            Arc::clone(&self.client),
            self.registry_for(AgentRole::SubAgent, None),
            Arc::clone(&self.approver),
            sub_agent_prompt(&self.environment()),
        )
    }
}

/// Outcome of a delegated task, already phrased for the parent model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationReport {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Spawner {
    factory: AgentFactory,
}

impl Spawner {
    #[must_use]
    pub fn new(factory: AgentFactory) -> Self {
        Self { factory }
    }

    /// Run a sub-agent to completion on its own task. Every failure, including a panic in the
    /// sub-run, comes back as a failed report.
    pub async fn spawn(&self, description: &str, prompt: &str, agent_type: &str) -> DelegationReport {
        logging::info(format!("Delegating task '{description}' to {agent_type} sub-agent"));
        let mut agent = self.factory.build_sub_agent();
        let prompt = prompt.to_string();
        let handle = tokio::spawn(async move { agent.run(&prompt).await });

        let failure = match handle.await {
            Ok(Ok(report)) => {
                return DelegationReport {
                    success: true,
                    content: format!(
                        "Task '{description}' completed successfully.\n\nAgent Type: {agent_type}\n\nResult:\n{report}"
                    ),
                    error: None,
                };
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(join_err) => join_err.to_string(),
        };

        logging::warn(format!("Sub-agent task '{description}' failed: {failure}"));
        DelegationReport {
            success: false,
            content: format!("Task '{description}' failed with error: {failure}"),
            error: Some(failure),
        }
    }
}
