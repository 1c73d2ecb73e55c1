//! `bash_tool`: run one shell command to completion with a hard timeout.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use wait_timeout::ChildExt;

use super::spec::{
    ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec, optional_str, optional_u64,
    required_str,
};

const MAX_OUTPUT_SIZE: usize = 30_000;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
/// How long to keep draining pipes after the shell exits or is killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Substrings that block a command outright.
const DANGEROUS_PATTERNS: [&str; 4] = ["rm -rf ", "mkfs", "dd if=/dev/zero", ":(){ :|:& };:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResult {
    pub status: ShellStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

struct TruncationMeta {
    original_len: usize,
    truncated: bool,
}

/// Run `command` through the platform shell, killing it after `timeout`.
pub fn execute_sync(command: &str, working_dir: &Path, timeout: Duration) -> Result<ShellResult> {
    let started = Instant::now();

    let mut cmd = shell_command(command);
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute: {command}"))?;

    let stdout_handle = child.stdout.take().context("Failed to capture stdout")?;
    let stderr_handle = child.stderr.take().context("Failed to capture stderr")?;

    let stdout_reader = PipeReader::spawn(stdout_handle);
    let stderr_reader = PipeReader::spawn(stderr_handle);

    let (status, exit_code) = match child.wait_timeout(timeout)? {
        Some(status) if status.success() => (ShellStatus::Completed, status.code()),
        Some(status) => (ShellStatus::Failed, status.code()),
        None => {
            kill_process_tree(&mut child);
            let code = child.wait().ok().and_then(|s| s.code());
            (ShellStatus::TimedOut, code)
        }
    };

    // A background process can keep the pipes open after the shell is gone.
    let stdout = stdout_reader.collect(PIPE_DRAIN_GRACE);
    let stderr = stderr_reader.collect(PIPE_DRAIN_GRACE);
    let (stdout, stdout_meta) = truncate_with_meta(&String::from_utf8_lossy(&stdout));
    let (stderr, stderr_meta) = truncate_with_meta(&String::from_utf8_lossy(&stderr));
    tracing::debug!(
        command,
        ?status,
        stdout_len = stdout_meta.original_len,
        stderr_len = stderr_meta.original_len,
        "shell command finished"
    );

    Ok(ShellResult {
        status,
        exit_code,
        stdout,
        stderr,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        stdout_truncated: stdout_meta.truncated,
        stderr_truncated: stderr_meta.truncated,
    })
}

/// Collects a child pipe on its own thread so the caller can stop waiting on it.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let (tx, done) = mpsc::channel();
        std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
            let _ = tx.send(());
        });
        Self { buf, done }
    }

    /// Everything read so far, waiting at most `grace` for end of stream.
    fn collect(self, grace: Duration) -> Vec<u8> {
        let _ = self.done.recv_timeout(grace);
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    // Own process group, so a timeout can take down everything the command started.
    cmd.process_group(0);
    cmd
}

#[cfg(all(not(unix), not(windows)))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    match libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; the group id is the child we spawned as leader.
        Ok(pgid) if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 => {}
        _ => {
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn dangerous_pattern(command: &str) -> Option<&'static str> {
    DANGEROUS_PATTERNS
        .iter()
        .copied()
        .find(|pattern| command.contains(pattern))
}

fn truncate_with_meta(output: &str) -> (String, TruncationMeta) {
    let original_len = output.len();
    if original_len <= MAX_OUTPUT_SIZE {
        return (
            output.to_string(),
            TruncationMeta {
                original_len,
                truncated: false,
            },
        );
    }

    let cut_index = char_boundary_at_or_before(output, MAX_OUTPUT_SIZE);
    let omitted = original_len.saturating_sub(cut_index);
    let note =
        format!("...\n\n[Output truncated at {MAX_OUTPUT_SIZE} bytes. {omitted} bytes omitted.]");

    (
        format!("{}{note}", &output[..cut_index]),
        TruncationMeta {
            original_len,
            truncated: true,
        },
    )
}

fn char_boundary_at_or_before(text: &str, max_bytes: usize) -> usize {
    if max_bytes >= text.len() {
        return text.len();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

pub struct BashTool;

#[async_trait]
impl ToolSpec for BashTool {
    fn name(&self) -> &'static str {
        "bash_tool"
    }

    fn description(&self) -> &'static str {
        "Execute a bash command in the working directory. Optional timeout in milliseconds (default \
         120000, max 600000). Output is truncated at 30000 bytes. Quote paths with spaces, chain \
         commands with ';' or '&&', and prefer the dedicated read, ls, glob and grep tools over \
         cat, ls, find and grep."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command to execute" },
                "timeout": { "type": "integer", "description": "Optional timeout in milliseconds (max 600000)" },
                "description": { "type": "string", "description": "What this command does in 5-10 words" }
            },
            "required": ["command"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ExecutesCode]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = required_str(&input, "command")?.to_string();
        if command.trim().is_empty() {
            return Err(ToolError::invalid_input("command cannot be empty"));
        }
        let timeout_ms = optional_u64(&input, "timeout", DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
        if let Some(description) = optional_str(&input, "description") {
            tracing::info!(command = %command, description, "running shell command");
        }

        if let Some(pattern) = dangerous_pattern(&command) {
            return Err(ToolError::permission_denied(format!(
                "Command contains potentially dangerous pattern: {pattern}"
            )));
        }

        let workspace = context.workspace.clone();
        let timeout = Duration::from_millis(timeout_ms);
        let run_command = command.clone();
        let result = tokio::task::spawn_blocking(move || {
            execute_sync(&run_command, &workspace, timeout)
        })
        .await
        .map_err(|e| ToolError::execution_failed(format!("Shell task failed: {e}")))?
        .map_err(|e| ToolError::execution_failed(format!("{e:#}")))?;

        let metadata = json!({
            "command": command,
            "status": result.status,
            "return_code": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "duration_ms": result.duration_ms,
            "stdout_truncated": result.stdout_truncated,
            "stderr_truncated": result.stderr_truncated,
        });

        match result.status {
            ShellStatus::Completed => Ok(ToolResult::success(result.stdout).with_metadata(metadata)),
            ShellStatus::Failed => {
                let code = result.exit_code.unwrap_or(-1);
                let detail = if result.stderr.is_empty() {
                    "Command failed"
                } else {
                    result.stderr.as_str()
                };
                Ok(ToolResult::error(format!("ERROR (exit code {code}): {detail}"))
                    .with_metadata(metadata))
            }
            ShellStatus::TimedOut => {
                let mut partial = result.stdout;
                if !result.stderr.is_empty() {
                    if !partial.is_empty() {
                        partial.push('\n');
                    }
                    partial.push_str(&result.stderr);
                }
                Err(ToolError::Timeout {
                    seconds: timeout_ms.div_ceil(1000),
                    partial_output: Some(partial),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn echo_command(message: &str) -> String {
        format!("echo {message}")
    }

    #[cfg(not(windows))]
    fn sleep_then_echo_command(seconds: u64, message: &str) -> String {
        format!("echo {message}; sleep {seconds}")
    }

    #[test]
    fn test_sync_execution() {
        let tmp = tempdir().expect("tempdir");
        let result = execute_sync(&echo_command("hello"), tmp.path(), Duration::from_secs(5))
            .expect("execute");

        assert_eq!(result.status, ShellStatus::Completed);
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_timeout_keeps_partial_output() {
        let tmp = tempdir().expect("tempdir");
        let result = execute_sync(
            &sleep_then_echo_command(5, "early"),
            tmp.path(),
            Duration::from_millis(300),
        )
        .expect("execute");

        assert_eq!(result.status, ShellStatus::TimedOut);
        assert!(result.stdout.contains("early"));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_is_a_hard_cap() {
        let tmp = tempdir().expect("tempdir");
        let started = Instant::now();
        let result = execute_sync("sleep 6; true", tmp.path(), Duration::from_millis(300))
            .expect("execute");

        assert_eq!(result.status, ShellStatus::TimedOut);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_background_children() {
        let tmp = tempdir().expect("tempdir");
        let started = Instant::now();
        let result = execute_sync(
            "(sleep 30; echo late) & echo started; wait",
            tmp.path(),
            Duration::from_millis(300),
        )
        .expect("execute");

        assert_eq!(result.status, ShellStatus::TimedOut);
        assert!(result.stdout.contains("started"));
        assert!(!result.stdout.contains("late"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_detached_child_does_not_hold_the_result() {
        let tmp = tempdir().expect("tempdir");
        let started = Instant::now();
        let result = execute_sync("sleep 5 & echo done", tmp.path(), Duration::from_secs(10))
            .expect("execute");

        assert_eq!(result.status, ShellStatus::Completed);
        assert!(result.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "é".repeat(MAX_OUTPUT_SIZE);
        let (out, meta) = truncate_with_meta(&text);
        assert!(meta.truncated);
        assert!(out.contains("[Output truncated at 30000 bytes."));
        assert_eq!(meta.original_len, text.len());
    }

    #[test]
    fn test_dangerous_patterns_detected() {
        assert_eq!(dangerous_pattern("rm -rf / --no-preserve-root"), Some("rm -rf "));
        assert_eq!(dangerous_pattern("sudo mkfs.ext4 /dev/sda"), Some("mkfs"));
        assert_eq!(dangerous_pattern("ls -la"), None);
    }

    #[tokio::test]
    async fn bash_tool_blocks_dangerous_commands() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ToolContext::new(tmp.path());
        let err = BashTool
            .execute(json!({"command": "rm -rf /tmp/x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn bash_tool_reports_exit_code_and_stderr() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ToolContext::new(tmp.path());
        let result = BashTool
            .execute(json!({"command": "echo oops >&2; exit 3"}), &ctx)
            .await
            .expect("execute");
        assert!(!result.success);
        assert_eq!(result.content, "ERROR (exit code 3): oops\n");
        assert_eq!(result.metadata.expect("metadata")["return_code"], 3);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn bash_tool_runs_in_workspace() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("marker.txt"), "").expect("write");
        let ctx = ToolContext::new(tmp.path());
        let result = BashTool
            .execute(json!({"command": "ls", "description": "List files"}), &ctx)
            .await
            .expect("execute");
        assert!(result.success);
        assert!(result.content.contains("marker.txt"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn bash_tool_timeout_is_an_error_with_partial_output() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ToolContext::new(tmp.path());
        let err = BashTool
            .execute(
                json!({"command": sleep_then_echo_command(5, "partial"), "timeout": 300}),
                &ctx,
            )
            .await
            .unwrap_err();
        match err {
            ToolError::Timeout { partial_output, .. } => {
                assert!(partial_output.unwrap_or_default().contains("partial"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
