//! Search tools: `glob_tool` (file names) and `grep_tool` (file contents).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use ignore::types::TypesBuilder;
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};

use super::spec::{
    ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_opt_u64,
    optional_str, required_str,
};

const GREP_TIMEOUT_SECS: u64 = 30;

// === GlobTool ===

pub struct GlobTool;

#[async_trait]
impl ToolSpec for GlobTool {
    fn name(&self) -> &'static str {
        "glob_tool"
    }

    fn description(&self) -> &'static str {
        "Fast file pattern matching. Supports patterns like \"**/*.rs\" or \"src/**/*.ts\". Returns \
         matching file paths sorted by modification time, newest first."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "The glob pattern to match files against" },
                "path": { "type": "string", "description": "The directory to search in. Omit to use the working directory." }
            },
            "required": ["pattern"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&input, "pattern")?.trim();
        if pattern.is_empty() {
            return Err(ToolError::invalid_input("pattern cannot be empty"));
        }
        let root = context.search_root(optional_str(&input, "path"));
        if !root.is_dir() {
            return Err(ToolError::not_found(&root));
        }

        let files = glob_files(&root, pattern)?;
        let mut content = format!(
            "Found {} files matching pattern '{pattern}' in {}",
            files.len(),
            root.display()
        );
        for file in &files {
            content.push('\n');
            content.push_str(&file.display().to_string());
        }
        let listed: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        Ok(ToolResult::success(content).with_metadata(json!({
            "count": files.len(),
            "files": listed,
            "search_path": root.display().to_string(),
        })))
    }
}

/// Regular files matching `pattern` under `root`, newest first.
fn glob_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        root.join(pattern).to_string_lossy().into_owned()
    };
    let paths = glob::glob(&full)
        .map_err(|e| ToolError::invalid_input(format!("Invalid glob pattern '{pattern}': {e}")))?;

    let mut found: Vec<(PathBuf, SystemTime)> = paths
        .flatten()
        .filter(|path| path.is_file())
        .map(|path| {
            let mtime = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (path, mtime)
        })
        .collect();
    found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(found.into_iter().map(|(path, _)| path).collect())
}

// === GrepTool ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

impl OutputMode {
    fn parse(raw: Option<&str>) -> Result<Self, ToolError> {
        match raw.unwrap_or("files_with_matches") {
            "content" => Ok(Self::Content),
            "files_with_matches" => Ok(Self::FilesWithMatches),
            "count" => Ok(Self::Count),
            other => Err(ToolError::invalid_input(format!(
                "Invalid output_mode: {other}. Must be one of: content, files_with_matches, count"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct GrepOptions {
    regex: Regex,
    mode: OutputMode,
    before: usize,
    after: usize,
    line_numbers: bool,
    multiline: bool,
    head_limit: Option<usize>,
    glob: Option<String>,
    file_type: Option<String>,
}

#[derive(Debug, Default)]
struct FileMatches {
    path: PathBuf,
    lines: Vec<String>,
    /// Zero-based indices of matching lines.
    hits: BTreeSet<usize>,
}

pub struct GrepTool;

#[async_trait]
impl ToolSpec for GrepTool {
    fn name(&self) -> &'static str {
        "grep_tool"
    }

    fn description(&self) -> &'static str {
        "Search file contents with a regular expression. Filter files with glob or type. \
         output_mode is \"files_with_matches\" (default), \"content\" (matching lines, supports \
         -A/-B/-C and -n) or \"count\". head_limit caps the number of output lines or entries. \
         Respects .gitignore."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "The regular expression pattern to search for" },
                "path": { "type": "string", "description": "File or directory to search in. Defaults to the working directory." },
                "glob": { "type": "string", "description": "Glob pattern to filter files (e.g. \"*.js\", \"*.{ts,tsx}\")" },
                "type": { "type": "string", "description": "File type to search (e.g. rust, py, js)" },
                "output_mode": { "type": "string", "enum": ["content", "files_with_matches", "count"] },
                "-A": { "type": "integer", "description": "Lines to show after each match (content mode)" },
                "-B": { "type": "integer", "description": "Lines to show before each match (content mode)" },
                "-C": { "type": "integer", "description": "Lines to show before and after each match (content mode)" },
                "-n": { "type": "boolean", "description": "Show line numbers (content mode)" },
                "-i": { "type": "boolean", "description": "Case insensitive search" },
                "head_limit": { "type": "integer", "description": "Limit output to the first N lines or entries" },
                "multiline": { "type": "boolean", "description": "Let patterns span lines and . match newlines" }
            },
            "required": ["pattern"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly]
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&input, "pattern")?.to_string();
        let root = context.search_root(optional_str(&input, "path"));
        if !root.exists() {
            return Err(ToolError::not_found(&root));
        }

        let multiline = optional_bool(&input, "multiline", false);
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(optional_bool(&input, "-i", false))
            .multi_line(multiline)
            .dot_matches_new_line(multiline)
            .build()
            .map_err(|e| ToolError::invalid_input(format!("Invalid regex pattern: {e}")))?;

        let context_lines = optional_opt_u64(&input, "-C");
        let count = |key: &str| {
            context_lines
                .or_else(|| optional_opt_u64(&input, key))
                .map_or(0, |v| usize::try_from(v).unwrap_or(usize::MAX))
        };
        let options = GrepOptions {
            regex,
            mode: OutputMode::parse(optional_str(&input, "output_mode"))?,
            before: count("-B"),
            after: count("-A"),
            line_numbers: optional_bool(&input, "-n", false),
            multiline,
            head_limit: optional_opt_u64(&input, "head_limit")
                .map(|v| usize::try_from(v).unwrap_or(usize::MAX)),
            glob: optional_str(&input, "glob").map(str::to_string),
            file_type: optional_str(&input, "type").map(str::to_string),
        };

        let task_options = options.clone();
        let task = tokio::task::spawn_blocking(move || search(&root, &task_options));
        let matches = match tokio::time::timeout(Duration::from_secs(GREP_TIMEOUT_SECS), task).await
        {
            Ok(joined) => joined
                .map_err(|e| ToolError::execution_failed(format!("Search task failed: {e}")))??,
            Err(_) => {
                return Err(ToolError::Timeout {
                    seconds: GREP_TIMEOUT_SECS,
                    partial_output: None,
                });
            }
        };

        Ok(render(&pattern, &options, &matches))
    }
}

fn search(root: &Path, options: &GrepOptions) -> Result<Vec<FileMatches>, ToolError> {
    let mut builder = WalkBuilder::new(root);
    builder
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b));

    if let Some(glob) = options.glob.as_deref() {
        let base = if root.is_dir() {
            root
        } else {
            root.parent().unwrap_or(root)
        };
        let overrides = OverrideBuilder::new(base)
            .add(glob)
            .and_then(|b| b.build())
            .map_err(|e| ToolError::invalid_input(format!("Invalid glob '{glob}': {e}")))?;
        builder.overrides(overrides);
    }
    if let Some(file_type) = options.file_type.as_deref() {
        let mut types = TypesBuilder::new();
        types.add_defaults();
        types.select(file_type);
        let types = types
            .build()
            .map_err(|e| ToolError::invalid_input(format!("Unknown file type '{file_type}': {e}")))?;
        builder.types(types);
    }

    let mut results = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.contains(&0) {
            continue;
        }
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };

        let hits = if options.multiline {
            multiline_hits(&options.regex, &text)
        } else {
            text.lines()
                .enumerate()
                .filter(|(_, line)| options.regex.is_match(line))
                .map(|(idx, _)| idx)
                .collect()
        };
        if hits.is_empty() {
            continue;
        }
        results.push(FileMatches {
            path: entry.into_path(),
            lines: text.lines().map(str::to_string).collect(),
            hits,
        });
    }
    Ok(results)
}

/// Every line touched by a match that may span several lines.
fn multiline_hits(regex: &Regex, text: &str) -> BTreeSet<usize> {
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect();
    let line_of = |offset: usize| match line_starts.binary_search(&offset) {
        Ok(idx) => idx,
        Err(idx) => idx.saturating_sub(1),
    };

    let mut hits = BTreeSet::new();
    for found in regex.find_iter(text) {
        let first = line_of(found.start());
        let last = line_of(found.end().saturating_sub(1).max(found.start()));
        hits.extend(first..=last);
    }
    hits
}

fn render(pattern: &str, options: &GrepOptions, matches: &[FileMatches]) -> ToolResult {
    if matches.is_empty() {
        return ToolResult::success(format!("No matches found for pattern '{pattern}'"))
            .with_metadata(json!({ "matches": 0 }));
    }
    let limit = options.head_limit.unwrap_or(usize::MAX);

    match options.mode {
        OutputMode::FilesWithMatches => {
            let files: Vec<String> = matches
                .iter()
                .take(limit)
                .map(|m| m.path.display().to_string())
                .collect();
            let content = format!(
                "Found {} files matching pattern '{pattern}'\n{}",
                files.len(),
                files.join("\n")
            );
            ToolResult::success(content).with_metadata(json!({
                "files": files,
                "count": matches.len(),
            }))
        }
        OutputMode::Count => {
            let total: usize = matches.iter().map(|m| m.hits.len()).sum();
            let rows: Vec<String> = matches
                .iter()
                .take(limit)
                .map(|m| format!("{}:{}", m.path.display(), m.hits.len()))
                .collect();
            let content = format!(
                "Found {total} matches in {} files for pattern '{pattern}'\n{}",
                matches.len(),
                rows.join("\n")
            );
            ToolResult::success(content).with_metadata(json!({
                "total_matches": total,
                "files": matches.len(),
            }))
        }
        OutputMode::Content => {
            let lines = content_lines(matches, options);
            let total = lines.len();
            let shown: Vec<String> = lines.into_iter().take(limit).collect();
            ToolResult::success(shown.join("\n")).with_metadata(json!({
                "lines": total,
                "truncated": total > shown.len(),
            }))
        }
    }
}

/// ripgrep-style lines: `path:n:text` for hits, `path-n-text` for context, `--` between groups.
fn content_lines(matches: &[FileMatches], options: &GrepOptions) -> Vec<String> {
    let with_context = options.before > 0 || options.after > 0;
    let mut out = Vec::new();
    for file in matches {
        let Some(last_line) = file.lines.len().checked_sub(1) else {
            continue;
        };
        let path = file.path.display();
        let mut last_shown: Option<usize> = None;
        for &hit in file.hits.iter().filter(|hit| **hit <= last_line) {
            let mut start = hit.saturating_sub(options.before);
            let end = hit.saturating_add(options.after).min(last_line);
            if let Some(last) = last_shown
                && start <= last
            {
                start = last + 1;
            }
            if start > end {
                continue;
            }
            let gap = last_shown.is_none_or(|last| start > last + 1);
            if with_context && gap && !out.is_empty() {
                out.push("--".to_string());
            }
            for idx in start..=end {
                let sep = if file.hits.contains(&idx) { ':' } else { '-' };
                let text = &file.lines[idx];
                if options.line_numbers {
                    out.push(format!("{path}{sep}{}{sep}{text}", idx + 1));
                } else {
                    out.push(format!("{path}{sep}{text}"));
                }
            }
            last_shown = Some(end);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempdir().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("src/nested")).expect("mkdir");
        std::fs::write(tmp.path().join("src/main.rs"), "fn main() {\n    helper();\n}\n")
            .expect("write");
        std::fs::write(
            tmp.path().join("src/nested/lib.rs"),
            "pub fn helper() {}\n// TODO: more\n",
        )
        .expect("write");
        std::fs::write(tmp.path().join("notes.md"), "Helper notes\n").expect("write");
        tmp
    }

    #[tokio::test]
    async fn glob_supports_recursive_patterns() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GlobTool
            .execute(json!({"pattern": "**/*.rs"}), &ctx)
            .await
            .expect("glob");
        assert!(result.content.starts_with("Found 2 files matching pattern '**/*.rs' in "));
        let meta = result.metadata.expect("metadata");
        assert_eq!(meta["count"], 2);
    }

    #[tokio::test]
    async fn glob_missing_directory_is_not_found() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let err = GlobTool
            .execute(json!({"pattern": "*", "path": "missing"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn grep_lists_matching_files_by_default() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GrepTool
            .execute(json!({"pattern": "helper"}), &ctx)
            .await
            .expect("grep");
        assert!(result.content.starts_with("Found 2 files matching pattern 'helper'"));
        assert!(!result.content.contains("notes.md"));
    }

    #[tokio::test]
    async fn grep_case_insensitive_with_type_filter() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GrepTool
            .execute(
                json!({"pattern": "helper", "-i": true, "type": "markdown", "output_mode": "count"}),
                &ctx,
            )
            .await
            .expect("grep");
        assert!(result.content.starts_with("Found 1 matches in 1 files"));
        assert!(result.content.contains("notes.md:1"));
    }

    #[tokio::test]
    async fn grep_content_mode_with_line_numbers_and_context() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GrepTool
            .execute(
                json!({
                    "pattern": "helper\\(\\);",
                    "output_mode": "content",
                    "-n": true,
                    "-B": 1,
                    "glob": "*.rs"
                }),
                &ctx,
            )
            .await
            .expect("grep");
        let main = tmp.path().join("src/main.rs").display().to_string();
        assert_eq!(
            result.content,
            format!("{main}-1-fn main() {{\n{main}:2:    helper();")
        );
    }

    #[tokio::test]
    async fn grep_multiline_and_head_limit() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GrepTool
            .execute(
                json!({
                    "pattern": "main\\(\\) \\{.*helper",
                    "multiline": true,
                    "output_mode": "content",
                    "head_limit": 1
                }),
                &ctx,
            )
            .await
            .expect("grep");
        assert_eq!(result.content.lines().count(), 1);
        assert!(result.content.ends_with("fn main() {"));
        assert_eq!(result.metadata.expect("metadata")["truncated"], true);
    }

    #[tokio::test]
    async fn grep_rejects_bad_regex_and_mode() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let err = GrepTool
            .execute(json!({"pattern": "("}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));

        let err = GrepTool
            .execute(json!({"pattern": "x", "output_mode": "lines"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid output_mode"));
    }

    #[tokio::test]
    async fn grep_reports_no_matches() {
        let tmp = fixture();
        let ctx = ToolContext::new(tmp.path());
        let result = GrepTool
            .execute(json!({"pattern": "zzz_absent"}), &ctx)
            .await
            .expect("grep");
        assert!(result.success);
        assert_eq!(result.content, "No matches found for pattern 'zzz_absent'");
    }
}
