//! File tools: read, write, edit, multi-edit, and directory listing.
//!
//! Every path must be absolute. Tools that mutate an existing file check the
//! shared [`FileAccessLedger`](super::ledger::FileAccessLedger) first.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Value, json};

use crate::error_taxonomy::ErrorEnvelope;

use super::spec::{
    ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec, optional_bool,
    optional_opt_u64, required_str,
};
use super::substitution::{self, EditFailure, EditOperation, SubstitutionError};

const DEFAULT_READ_LIMIT: u64 = 2000;
const MAX_LINE_CHARS: usize = 2000;
const BINARY_PREVIEW_BYTES: usize = 1024;

const READ_FIRST_EDIT: &str = "You must use your Read tool at least once before editing this file. Please read the file first to understand its content.";
const READ_FIRST_WRITE: &str = "You must use the Read tool first to read the file's contents before overwriting it. This tool will fail if you did not read the file first.";

// === ReadFileTool ===

pub struct ReadFileTool;

#[async_trait]
impl ToolSpec for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_tool"
    }

    fn description(&self) -> &'static str {
        "Read a file from the local filesystem. file_path must be absolute. Reads up to 2000 lines \
         from the start by default; use offset (1-based) and limit for long files. Output uses \
         cat -n style line numbers. Lines longer than 2000 characters are truncated."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "The absolute path to the file to read" },
                "offset": { "type": "integer", "description": "The line number to start reading from" },
                "limit": { "type": "integer", "description": "The number of lines to read" }
            },
            "required": ["file_path"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = required_str(&input, "file_path")?;
        let path = context.require_absolute(raw)?;
        let metadata = std::fs::metadata(&path).map_err(|e| ToolError::from_io(&e, &path))?;
        if !metadata.is_file() {
            return Err(ToolError::invalid_input(format!(
                "Path is not a file: {}",
                path.display()
            )));
        }
        if has_extension(&path, "ipynb") {
            return Err(ToolError::invalid_input(
                "Jupyter notebooks (.ipynb files) are not supported by this tool",
            ));
        }

        let file_size = metadata.len();
        if file_size == 0 {
            context.ledger.mark_read(&path);
            return Ok(
                ToolResult::success("*** WARNING: File exists but has empty contents ***")
                    .with_metadata(json!({
                        "lines_read": 0,
                        "total_lines": 0,
                        "file_size": 0,
                        "truncated": false,
                    })),
            );
        }

        let bytes = std::fs::read(&path).map_err(|e| ToolError::from_io(&e, &path))?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                let bytes = err.into_bytes();
                let preview = &bytes[..bytes.len().min(BINARY_PREVIEW_BYTES)];
                context.ledger.mark_read(&path);
                return Ok(ToolResult::success(format!(
                    "[BINARY FILE: {}]\nFirst 1KB of binary data (base64 encoded):\n{}",
                    path.display(),
                    base64::engine::general_purpose::STANDARD.encode(preview)
                ))
                .with_metadata(json!({ "file_size": file_size, "is_binary": true })));
            }
        };

        let start_line = optional_opt_u64(&input, "offset").unwrap_or(1).max(1);
        let limit = optional_opt_u64(&input, "limit")
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_READ_LIMIT);
        let window = render_lines(&text, start_line, limit);

        context.ledger.mark_read(&path);
        Ok(ToolResult::success(window.rendered).with_metadata(json!({
            "lines_read": window.lines_read,
            "total_lines": window.total_lines,
            "start_line": start_line,
            "truncated": window.truncated,
            "file_size": file_size,
        })))
    }
}

struct LineWindow {
    rendered: String,
    lines_read: usize,
    total_lines: usize,
    truncated: bool,
}

fn render_lines(text: &str, start_line: u64, limit: u64) -> LineWindow {
    let skip = usize::try_from(start_line.saturating_sub(1)).unwrap_or(usize::MAX);
    let take = usize::try_from(limit).unwrap_or(usize::MAX);
    let total_lines = text.lines().count();

    let rendered: Vec<String> = text
        .lines()
        .enumerate()
        .skip(skip)
        .take(take)
        .map(|(idx, line)| {
            let number = idx + 1;
            if line.chars().count() > MAX_LINE_CHARS {
                let head: String = line.chars().take(MAX_LINE_CHARS).collect();
                format!("{number:6}|{head}... [TRUNCATED]")
            } else {
                format!("{number:6}|{line}")
            }
        })
        .collect();

    let lines_read = rendered.len();
    LineWindow {
        rendered: rendered.join("\n"),
        lines_read,
        total_lines,
        truncated: skip.saturating_add(lines_read) < total_lines,
    }
}

// === WriteFileTool ===

pub struct WriteFileTool;

#[async_trait]
impl ToolSpec for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_tool"
    }

    fn description(&self) -> &'static str {
        "Write a file to the local filesystem, overwriting any existing file. An existing file must \
         be read with the read tool first. Prefer editing existing files over writing new ones."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "The absolute path to the file to write" },
                "content": { "type": "string", "description": "The content to write to the file" }
            },
            "required": ["file_path", "content"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::WritesFiles]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.require_absolute(required_str(&input, "file_path")?)?;
        let content = required_str(&input, "content")?;

        let existed = path.exists();
        if path.is_dir() {
            return Err(ToolError::invalid_input(format!(
                "Path is a directory, not a file: {}",
                path.display()
            )));
        }
        if existed && !context.ledger.is_read(&path) {
            return Err(ToolError::precondition(READ_FIRST_WRITE));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolError::from_io(&e, parent))?;
        }
        std::fs::write(&path, content).map_err(|e| ToolError::from_io(&e, &path))?;
        context.ledger.mark_read(&path);

        let verb = if existed { "overwrote" } else { "created" };
        let lines = content.lines().count();
        let chars = content.chars().count();
        Ok(ToolResult::success(format!(
            "Successfully {verb} file: {} ({lines} lines, {chars} characters)",
            path.display()
        ))
        .with_metadata(json!({
            "operation": if existed { "overwrite" } else { "create" },
            "content_lines": lines,
            "content_chars": chars,
            "new_size_bytes": content.len(),
        })))
    }
}

// === EditFileTool ===

pub struct EditFileTool;

#[async_trait]
impl ToolSpec for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_tool"
    }

    fn description(&self) -> &'static str {
        "Perform an exact string replacement in a file. The file must have been read first. Fails \
         when old_string is not unique unless replace_all is set. Preserve indentation exactly as \
         it appears after the line-number prefix of read output."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "The absolute path to the file to modify" },
                "old_string": { "type": "string", "description": "The text to replace" },
                "new_string": { "type": "string", "description": "The text to replace it with (must be different from old_string)" },
                "replace_all": { "type": "boolean", "default": false, "description": "Replace all occurrences of old_string" }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::WritesFiles]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.require_absolute(required_str(&input, "file_path")?)?;
        let old_string = required_str(&input, "old_string")?;
        let new_string = required_str(&input, "new_string")?;
        let replace_all = optional_bool(&input, "replace_all", false);

        if old_string == new_string {
            return Err(ToolError::invalid_input(
                "old_string and new_string must be different",
            ));
        }
        if old_string.is_empty() {
            return Err(ToolError::invalid_input(
                "old_string cannot be empty; use write_tool or multi_edit_tool to create files",
            ));
        }
        if !path.exists() {
            return Err(ToolError::not_found(&path));
        }
        if !context.ledger.is_read(&path) {
            return Err(ToolError::precondition(READ_FIRST_EDIT));
        }

        let edit = EditOperation::new(old_string, new_string, replace_all);
        match substitution::commit(&path, std::slice::from_ref(&edit)) {
            Ok(replay) => {
                context.ledger.mark_read(&path);
                let made = replay.total_replacements();
                let verb = if replace_all { "replaced all" } else { "replaced" };
                Ok(ToolResult::success(format!(
                    "Successfully {verb} {made} occurrence(s) of the specified string in {}",
                    path.display()
                ))
                .with_metadata(json!({
                    "replacements_made": made,
                    "total_occurrences_found": made,
                    "replace_all_used": replace_all,
                    "new_lines": replay.content.lines().count(),
                    "file_size_bytes": replay.content.len(),
                })))
            }
            Err(SubstitutionError::Edit(failure)) => Ok(edit_failure_result(
                failure.reason.to_string(),
                json!({ "occurrences": failure.occurrences() }),
            )),
            Err(err) => Err(substitution_tool_error(err, &path)),
        }
    }
}

// === MultiEditTool ===

pub struct MultiEditTool;

#[async_trait]
impl ToolSpec for MultiEditTool {
    fn name(&self) -> &'static str {
        "multi_edit_tool"
    }

    fn description(&self) -> &'static str {
        "Apply several exact string replacements to one file as a single atomic operation. Edits run \
         in order, each on the result of the previous one; if any edit fails none are applied. To \
         create a new file, give an empty old_string in the first edit."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "The absolute path to the file to modify" },
                "edits": {
                    "type": "array",
                    "minItems": 1,
                    "description": "Edit operations to perform sequentially",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" },
                            "replace_all": { "type": "boolean", "default": false }
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["file_path", "edits"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::WritesFiles]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.require_absolute(required_str(&input, "file_path")?)?;
        let raw_edits = input
            .get("edits")
            .cloned()
            .ok_or_else(|| ToolError::missing_field("edits"))?;
        let edits: Vec<EditOperation> = serde_json::from_value(raw_edits)
            .map_err(|e| ToolError::invalid_input(format!("edits: {e}")))?;
        let Some(first) = edits.first() else {
            return Err(ToolError::invalid_input(
                "No edits provided. At least one edit operation is required.",
            ));
        };

        let creating = first.old_string.is_empty();
        if !creating {
            if !path.exists() {
                return Err(ToolError::not_found(&path));
            }
            if !context.ledger.is_read(&path) {
                return Err(ToolError::precondition(READ_FIRST_EDIT));
            }
        }

        match substitution::commit(&path, &edits) {
            Ok(replay) => {
                context.ledger.mark_read(&path);
                let operation = if replay.created { "created" } else { "edited" };
                let total = replay.total_replacements();
                let details: Vec<Value> = edits
                    .iter()
                    .zip(&replay.replacements)
                    .enumerate()
                    .map(|(idx, (edit, made))| {
                        json!({
                            "edit_number": idx + 1,
                            "replacements_made": made,
                            "replace_all_used": edit.replace_all,
                        })
                    })
                    .collect();
                Ok(ToolResult::success(format!(
                    "Successfully {operation} file {} with {} edit operation(s), making {total} total replacement(s)",
                    path.display(),
                    edits.len()
                ))
                .with_metadata(json!({
                    "operation_type": operation,
                    "total_edits": edits.len(),
                    "total_replacements": total,
                    "edit_details": details,
                    "final_lines": replay.content.lines().count(),
                })))
            }
            Err(SubstitutionError::Edit(failure)) => Ok(multi_edit_failure(&failure, edits.len())),
            Err(err) => Err(substitution_tool_error(err, &path)),
        }
    }
}

fn multi_edit_failure(failure: &EditFailure, total_edits: usize) -> ToolResult {
    edit_failure_result(
        failure.to_string(),
        json!({
            "failed_edit": failure.index + 1,
            "occurrences": failure.occurrences(),
            "edits_processed": 0,
            "total_edits": total_edits,
        }),
    )
}

/// Edit failures are validation errors that also carry per-edit detail.
fn edit_failure_result(message: String, detail: Value) -> ToolResult {
    let envelope = ErrorEnvelope::from(ToolError::invalid_input(message.clone()));
    let mut metadata = envelope.to_metadata();
    if let (Some(map), Value::Object(extra)) = (metadata.as_object_mut(), detail) {
        map.extend(extra);
    }
    ToolResult::error(format!("ERROR: {message}")).with_metadata(metadata)
}

fn substitution_tool_error(err: SubstitutionError, path: &Path) -> ToolError {
    match err {
        SubstitutionError::Io { source, .. } => ToolError::from_io(&source, path),
        other => ToolError::invalid_input(other.to_string()),
    }
}

// === ListDirTool ===

pub struct ListDirTool;

#[async_trait]
impl ToolSpec for ListDirTool {
    fn name(&self) -> &'static str {
        "ls_tool"
    }

    fn description(&self) -> &'static str {
        "List files and directories in a directory. path must be absolute. Optionally pass glob \
         patterns in ignore to skip matching entry names. Prefer glob_tool and grep_tool when you \
         know what to search for."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The absolute path to the directory to list" },
                "ignore": { "type": "array", "items": { "type": "string" }, "description": "List of glob patterns to ignore" }
            },
            "required": ["path"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = context.require_absolute(required_str(&input, "path")?)?;
        if !path.exists() {
            return Err(ToolError::not_found(&path));
        }
        if !path.is_dir() {
            return Err(ToolError::invalid_input(format!(
                "Path is not a directory: {}",
                path.display()
            )));
        }

        let ignore = input
            .get("ignore")
            .and_then(Value::as_array)
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|raw| {
                        glob::Pattern::new(raw).map_err(|e| {
                            ToolError::invalid_input(format!("Invalid ignore pattern '{raw}': {e}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(|e| ToolError::from_io(&e, &path))? {
            let entry = entry.map_err(|e| ToolError::from_io(&e, &path))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if ignore.iter().any(|pattern| pattern.matches(&name)) {
                continue;
            }
            let full = entry.path();
            let kind = match std::fs::metadata(&full) {
                Ok(meta) if meta.is_dir() => "directory",
                Ok(meta) if meta.is_file() => "file",
                Ok(_) => "other",
                Err(_) => "unknown",
            };
            entries.push((name, full, kind));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let files = entries.iter().filter(|e| e.2 == "file").count();
        let dirs = entries.iter().filter(|e| e.2 == "directory").count();
        let mut content = format!(
            "Listed {} entries in {}: {files} files, {dirs} directories",
            entries.len(),
            path.display()
        );
        for (name, _, kind) in &entries {
            content.push_str("\n- ");
            content.push_str(name);
            if *kind == "directory" {
                content.push('/');
            }
        }

        let listed: Vec<Value> = entries
            .iter()
            .map(|(name, full, kind)| {
                json!({ "name": name, "path": full.display().to_string(), "type": kind })
            })
            .collect();
        Ok(ToolResult::success(content).with_metadata(json!({
            "count": entries.len(),
            "entries": listed,
            "summary": {
                "files": files,
                "directories": dirs,
                "other": entries.len() - files - dirs,
            },
        })))
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(ext))
}
