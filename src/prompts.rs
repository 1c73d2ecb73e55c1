//! System prompts and `<system-reminder>` messages.

use std::path::{Path, PathBuf};

use crate::tools::todo::TodoList;

// Prompt files loaded at compile time
pub const MAIN_AGENT_PROMPT: &str = include_str!("prompts/main_agent.txt");
pub const SUB_AGENT_PROMPT: &str = include_str!("prompts/sub_agent.txt");
pub const GENERAL_REMINDER: &str = include_str!("prompts/reminder.txt");
pub const EMPTY_TODO_REMINDER: &str = include_str!("prompts/todo_empty.txt");
const TODO_CHANGED_REMINDER: &str = include_str!("prompts/todo_changed.txt");

pub const IDENTITY_PROMPT: &str = "You are openclaude, an open-source command-line coding assistant.";

/// Facts about the machine and workspace the model is told about.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub working_directory: PathBuf,
    pub is_git_repo: bool,
    pub platform: String,
    pub date: String,
    pub model: String,
}

impl EnvironmentInfo {
    pub fn detect(workspace: &Path, model: &str) -> Self {
        Self {
            working_directory: workspace.to_path_buf(),
            is_git_repo: workspace.ancestors().any(|dir| dir.join(".git").exists()),
            platform: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
            model: model.to_string(),
        }
    }

    fn render(&self) -> String {
        format!(
            "Environment:\n- Working directory: {}\n- Is directory a git repo: {}\n- Platform: {}\n- Today's date: {}\n- Model: {}",
            self.working_directory.display(),
            if self.is_git_repo { "Yes" } else { "No" },
            self.platform,
            self.date,
            self.model,
        )
    }
}

#[must_use]
pub fn main_agent_prompt(env: &EnvironmentInfo) -> String {
    MAIN_AGENT_PROMPT
        .replace("{environment}", &env.render())
        .trim()
        .to_string()
}

#[must_use]
pub fn sub_agent_prompt(env: &EnvironmentInfo) -> String {
    SUB_AGENT_PROMPT
        .replace("{environment}", &env.render())
        .trim()
        .to_string()
}

/// Reminder appended after a successful todo write, embedding the list as JSON.
#[must_use]
pub fn todo_changed_reminder(list: &TodoList) -> String {
    TODO_CHANGED_REMINDER
        .replace("{todos}", &list.to_json().to_string())
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::todo::{TaskRecord, TodoPriority, TodoStatus};

    fn env() -> EnvironmentInfo {
        EnvironmentInfo {
            working_directory: PathBuf::from("/work"),
            is_git_repo: true,
            platform: "linux (x86_64)".to_string(),
            date: "2025-01-01".to_string(),
            model: "test-model".to_string(),
        }
    }

    #[test]
    fn prompts_embed_environment() {
        for prompt in [main_agent_prompt(&env()), sub_agent_prompt(&env())] {
            assert!(prompt.contains("Working directory: /work"));
            assert!(prompt.contains("Model: test-model"));
            assert!(!prompt.contains("{environment}"));
        }
    }

    #[test]
    fn reminders_are_wrapped() {
        for reminder in [GENERAL_REMINDER, EMPTY_TODO_REMINDER] {
            assert!(reminder.trim().starts_with("<system-reminder>"));
            assert!(reminder.trim().ends_with("</system-reminder>"));
        }
    }

    #[test]
    fn todo_changed_reminder_embeds_json() {
        let mut list = TodoList::new();
        list.write(vec![TaskRecord {
            content: "write tests".to_string(),
            status: TodoStatus::InProgress,
            priority: TodoPriority::High,
            id: "1".to_string(),
        }])
        .expect("valid list");

        let reminder = todo_changed_reminder(&list);
        assert!(reminder.contains(r#""content":"write tests""#));
        assert!(reminder.contains(r#""status":"in_progress""#));
        assert!(reminder.ends_with("</system-reminder>"));
    }
}
