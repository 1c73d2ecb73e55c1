//! CLI entry point for openclaude.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dotenvy::dotenv;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;

use openclaude::client::OpenAiCompatClient;
use openclaude::config::Config;
use openclaude::core::approval::{
    APPROVAL_PROMPT, ApprovalDecision, ApprovalRequest, ChannelApprover, parse_decision,
};
use openclaude::core::engine::{Orchestrator, OrchestratorConfig, summarize_input};
use openclaude::core::events::Event;
use openclaude::core::spawner::AgentFactory;
use openclaude::error_taxonomy::classify;
use openclaude::logging;
use openclaude::tools::{FileAccessLedger, new_shared_todo_list};

const EXIT_WORDS: [&str; 4] = ["exit", "quit", "bye", "q"];

#[derive(Parser, Debug)]
#[command(
    name = "openclaude",
    author,
    version,
    about = "Coding assistant that acts through tools you approve",
    long_about = "Chat with an OpenAI-compatible model that can read, search, edit, and run code in \
                  your workspace. Every tool call waits for your approval."
)]
struct Cli {
    /// Run a single prompt and exit
    #[arg(short = 'p', long)]
    prompt: Option<String>,

    /// Path to the config file (default: ~/.openclaude/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile to apply over the base settings
    #[arg(long)]
    profile: Option<String>,

    /// Workspace directory the tools operate in
    #[arg(short = 'w', long)]
    workspace: Option<PathBuf>,

    /// Model to use instead of the configured one
    #[arg(long)]
    model: Option<String>,

    /// Debug logging for this crate
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = run(cli).await {
        let envelope = classify(&err);
        eprintln!("{} {}", "error:".red().bold(), envelope);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.clone(), cli.profile.as_deref())?;
    if let Some(model) = cli.model.clone() {
        config.model = Some(model);
    }

    let workspace = match cli.workspace.clone() {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
    std::env::set_current_dir(&workspace)
        .with_context(|| format!("Failed to enter workspace {}", workspace.display()))?;

    let client = Arc::new(OpenAiCompatClient::new(&config)?);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = AgentFactory::new(
        client,
        Arc::new(ChannelApprover::new(tx.clone())),
        FileAccessLedger::new(),
        OrchestratorConfig {
            model: config.model(),
            workspace: workspace.clone(),
            max_tokens: config.max_tokens(),
            max_steps: config.max_steps(),
        },
    );
    let agent = factory.build_main(new_shared_todo_list(), Some(tx));
    let mut editor = DefaultEditor::new().context("Failed to initialise line editor")?;

    if let Some(prompt) = cli.prompt {
        let (_, result) = run_query(agent, prompt, &mut rx, &mut editor).await?;
        return result.map(|_| ());
    }

    print_banner(&config.model(), &workspace);
    repl(agent, &mut rx, &mut editor).await
}

fn print_banner(model: &str, workspace: &std::path::Path) {
    println!("{}", "openclaude".bold());
    println!("  {} model: {model}", "·".dimmed());
    println!("  {} workspace: {}", "·".dimmed(), workspace.display());
    println!(
        "  {} type {} to leave",
        "·".dimmed(),
        EXIT_WORDS.join(", ").dimmed()
    );
    println!();
}

async fn repl(
    mut agent: Orchestrator,
    rx: &mut mpsc::UnboundedReceiver<Event>,
    editor: &mut DefaultEditor,
) -> Result<()> {
    loop {
        let line = match tokio::task::block_in_place(|| editor.readline("> ")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("Failed to read input"),
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if EXIT_WORDS.contains(&query.to_lowercase().as_str()) {
            break;
        }
        let _ = editor.add_history_entry(query);

        let (next, result) = run_query(agent, query.to_string(), rx, editor).await?;
        agent = next;
        if let Err(err) = result {
            eprintln!("{} {}", "error:".red().bold(), classify(&err));
        }
    }
    println!("Goodbye!");
    Ok(())
}

/// Run one query on a background task while this task renders its events and answers
/// approval prompts. Hands the agent back for the next query.
async fn run_query(
    mut agent: Orchestrator,
    query: String,
    rx: &mut mpsc::UnboundedReceiver<Event>,
    editor: &mut DefaultEditor,
) -> Result<(Orchestrator, Result<String>)> {
    let mut handle = tokio::spawn(async move {
        let result = agent.run(&query).await;
        (agent, result)
    });

    let mut renderer = Renderer::default();
    let joined = loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => renderer.render(event, editor),
            joined = &mut handle => break joined,
        }
    };
    while let Ok(event) = rx.try_recv() {
        renderer.render(event, editor);
    }
    renderer.finish_line();

    joined.context("Agent task panicked")
}

#[derive(Default)]
struct Renderer {
    mid_line: bool,
}

impl Renderer {
    fn render(&mut self, event: Event, editor: &mut DefaultEditor) {
        match event {
            Event::StepStarted { agent, step } => {
                if logging::is_verbose() {
                    self.finish_line();
                    eprintln!("{}", format!("[{}] step {step}", agent.label()).dimmed());
                }
            }
            Event::MessageDelta { content } => {
                print!("{content}");
                let _ = io::stdout().flush();
                self.mid_line = !content.ends_with('\n');
            }
            Event::MessageComplete => self.finish_line(),
            Event::ToolCallStarted { name, input, .. } => {
                self.finish_line();
                eprintln!(
                    "{} {} {}",
                    "tool:".cyan().bold(),
                    name,
                    summarize_input(&input, 160).dimmed()
                );
            }
            Event::ApprovalRequired { request, reply } => {
                self.finish_line();
                let _ = reply.send(ask_approval(editor, &request));
            }
            Event::ToolCallRejected { name, .. } => {
                eprintln!("{} {name}", "rejected:".yellow());
            }
            Event::ToolCallComplete { name, result, .. } => {
                let label = if result.success {
                    "done:".green()
                } else {
                    "failed:".red()
                };
                eprintln!("{label} {name}: {}", first_line(&result.content));
            }
            Event::TodosUpdated { list } => {
                eprintln!("{}\n{list}", "Todos".bold());
            }
            Event::Error {
                message,
                recoverable,
            } => {
                // Fatal errors are reported once, classified, by the caller.
                if recoverable {
                    self.finish_line();
                    eprintln!("{} {message}", "warning:".yellow());
                } else {
                    tracing::debug!(error = %message, "agent stopped");
                }
            }
            Event::Status { message } => {
                self.finish_line();
                eprintln!("{}", message.dimmed());
            }
        }
    }

    fn finish_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

fn ask_approval(editor: &mut DefaultEditor, request: &ApprovalRequest) -> ApprovalDecision {
    eprintln!(
        "{} {} wants to run {}",
        "?".yellow().bold(),
        request.agent.label(),
        request.tool_name.bold()
    );
    eprintln!("  {}", request.input.to_string().dimmed());
    match tokio::task::block_in_place(|| editor.readline(APPROVAL_PROMPT)) {
        Ok(answer) => parse_decision(&answer),
        Err(_) => ApprovalDecision::Rejected,
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > 160 {
        format!("{}...", line.chars().take(160).collect::<String>())
    } else {
        line.to_string()
    }
}
