//! All-or-nothing text substitution over a single file.
//!
//! A sequence of [`EditOperation`]s is first replayed against a scratch copy of
//! the file. Only when every operation succeeds is the same sequence replayed
//! against the real content and written back with one atomic rename. A
//! sequence that fails anywhere leaves the file untouched.
//!
//! An empty `old_string` in the first operation is the creation sentinel: the
//! target must not exist yet and the operation's `new_string` becomes the
//! initial content that later operations edit.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// One substitution step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOperation {
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

impl EditOperation {
    pub fn new(old: impl Into<String>, new: impl Into<String>, replace_all: bool) -> Self {
        Self {
            old_string: old.into(),
            new_string: new.into(),
            replace_all,
        }
    }

    fn is_creation_sentinel(&self) -> bool {
        self.old_string.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditFailureReason {
    #[error("old_string and new_string must be different")]
    Identical,
    #[error("old_string cannot be empty except in the first edit of a new file")]
    MisplacedSentinel,
    #[error("Cannot create new file - file already exists.")]
    AlreadyExists,
    #[error("File does not exist. Use an empty old_string in the first edit to create it.")]
    MissingFile,
    #[error(
        "String not found in file. Make sure old_string matches exactly, including whitespace and indentation."
    )]
    NotFound,
    #[error(
        "old_string appears {occurrences} times in the file. Provide more surrounding context to make it unique or set replace_all to true."
    )]
    Ambiguous { occurrences: usize },
}

/// The first operation that could not be applied. `index` is zero-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Edit {}: {reason}", .index + 1)]
pub struct EditFailure {
    pub index: usize,
    pub reason: EditFailureReason,
}

impl EditFailure {
    #[must_use]
    pub fn occurrences(&self) -> Option<usize> {
        match self.reason {
            EditFailureReason::Ambiguous { occurrences } => Some(occurrences),
            EditFailureReason::NotFound => Some(0),
            _ => None,
        }
    }
}

/// Outcome of a successful replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub content: String,
    /// Replacements performed by each operation, in order.
    pub replacements: Vec<usize>,
    pub created: bool,
}

impl Replay {
    #[must_use]
    pub fn total_replacements(&self) -> usize {
        self.replacements.iter().sum()
    }
}

#[derive(Debug, Error)]
pub enum SubstitutionError {
    #[error("edits cannot be empty")]
    NoEdits,
    #[error(transparent)]
    Edit(#[from] EditFailure),
    #[error("Path is not a file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("File is not a text file or has encoding issues: {}", .0.display())]
    NotUtf8(PathBuf),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SubstitutionError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// === Phase 1 ===

/// Replay `edits` against a scratch copy of `original` (`None` when the file
/// does not exist) without touching anything on disk.
pub fn validate(original: Option<&str>, edits: &[EditOperation]) -> Result<Replay, EditFailure> {
    let mut scratch = original.unwrap_or_default().to_string();
    let replacements = replay_into(&mut scratch, original.is_some(), edits)?;
    Ok(Replay {
        content: scratch,
        replacements,
        created: original.is_none(),
    })
}

// === Phase 1 + Phase 2 ===

/// Validate `edits` against the file at `path`, then apply and persist them.
pub fn commit(path: &Path, edits: &[EditOperation]) -> Result<Replay, SubstitutionError> {
    if edits.is_empty() {
        return Err(SubstitutionError::NoEdits);
    }

    let original = load(path)?;
    let scratch = validate(original.as_deref(), edits)?;

    let exists = original.is_some();
    let mut authoritative = original.unwrap_or_default();
    let replacements = replay_into(&mut authoritative, exists, edits)?;
    debug_assert_eq!(authoritative, scratch.content);

    persist(path, &authoritative)?;
    tracing::debug!(
        path = %path.display(),
        edits = edits.len(),
        created = !exists,
        "substitution committed"
    );

    Ok(Replay {
        content: authoritative,
        replacements,
        created: !exists,
    })
}

// === Internals ===

fn replay_into(
    buffer: &mut String,
    exists: bool,
    edits: &[EditOperation],
) -> Result<Vec<usize>, EditFailure> {
    let mut replacements = Vec::with_capacity(edits.len());
    for (index, edit) in edits.iter().enumerate() {
        let fail = |reason| EditFailure { index, reason };

        if edit.is_creation_sentinel() {
            if index != 0 {
                return Err(fail(EditFailureReason::MisplacedSentinel));
            }
            if exists {
                return Err(fail(EditFailureReason::AlreadyExists));
            }
            buffer.clear();
            buffer.push_str(&edit.new_string);
            replacements.push(1);
            continue;
        }

        if index == 0 && !exists {
            return Err(fail(EditFailureReason::MissingFile));
        }
        if edit.old_string == edit.new_string {
            return Err(fail(EditFailureReason::Identical));
        }

        let occurrences = buffer.matches(edit.old_string.as_str()).count();
        if occurrences == 0 {
            return Err(fail(EditFailureReason::NotFound));
        }
        if occurrences > 1 && !edit.replace_all {
            return Err(fail(EditFailureReason::Ambiguous { occurrences }));
        }

        *buffer = if edit.replace_all {
            buffer.replace(edit.old_string.as_str(), &edit.new_string)
        } else {
            buffer.replacen(edit.old_string.as_str(), &edit.new_string, 1)
        };
        replacements.push(occurrences);
    }
    Ok(replacements)
}

fn load(path: &Path) -> Result<Option<String>, SubstitutionError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SubstitutionError::io(path, err)),
    };
    if !metadata.is_file() {
        return Err(SubstitutionError::NotAFile(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(|err| SubstitutionError::io(path, err))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| SubstitutionError::NotUtf8(path.to_path_buf()))
}

/// Write through a sibling temp file so readers never observe a partial file.
fn persist(path: &Path, content: &str) -> Result<(), SubstitutionError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|err| SubstitutionError::io(parent, err))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|err| SubstitutionError::io(parent, err))?;
    if let Ok(metadata) = std::fs::metadata(path) {
        tmp.as_file()
            .set_permissions(metadata.permissions())
            .map_err(|err| SubstitutionError::io(path, err))?;
    }
    tmp.write_all(content.as_bytes())
        .map_err(|err| SubstitutionError::io(path, err))?;
    tmp.persist(path)
        .map_err(|err| SubstitutionError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn op(old: &str, new: &str, replace_all: bool) -> EditOperation {
        EditOperation::new(old, new, replace_all)
    }

    #[test]
    fn ambiguous_single_replacement_reports_occurrences() {
        let err = validate(Some("foo bar foo"), &[op("foo", "baz", false)]).unwrap_err();
        assert_eq!(err.index, 0);
        assert_eq!(err.reason, EditFailureReason::Ambiguous { occurrences: 2 });
        assert_eq!(err.occurrences(), Some(2));
        assert!(err.to_string().starts_with("Edit 1:"));
    }

    #[test]
    fn replace_all_rewrites_every_occurrence() {
        let replay = validate(Some("foo bar foo"), &[op("foo", "baz", true)]).expect("valid");
        assert_eq!(replay.content, "baz bar baz");
        assert_eq!(replay.replacements, vec![2]);
        assert_eq!(replay.total_replacements(), 2);
    }

    #[test]
    fn later_edits_see_earlier_results() {
        // "a" is unique only after the first edit removes the other one.
        let edits = [op("a a", "b a", false), op("b", "c", false), op("a", "d", false)];
        let replay = validate(Some("a a"), &edits).expect("valid");
        assert_eq!(replay.content, "c d");
    }

    #[test]
    fn uniqueness_is_judged_after_prior_edits() {
        let edits = [op("x", "y", false), op("y", "z", false)];
        let err = validate(Some("x y"), &edits).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.reason, EditFailureReason::Ambiguous { occurrences: 2 });
    }

    #[test]
    fn identical_strings_are_rejected() {
        let err = validate(Some("abc"), &[op("b", "b", false)]).unwrap_err();
        assert_eq!(err.reason, EditFailureReason::Identical);
        assert_eq!(err.to_string(), "Edit 1: old_string and new_string must be different");
    }

    #[test]
    fn missing_text_is_reported_with_its_index() {
        let edits = [op("a", "b", false), op("zzz", "y", false)];
        let err = validate(Some("abc"), &edits).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.reason, EditFailureReason::NotFound);
    }

    #[test]
    fn sentinel_is_only_legal_first_on_missing_file() {
        let err = validate(Some("abc"), &[op("", "new", false)]).unwrap_err();
        assert_eq!(err.reason, EditFailureReason::AlreadyExists);

        let edits = [op("", "hello", false), op("", "again", false)];
        let err = validate(None, &edits).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.reason, EditFailureReason::MisplacedSentinel);

        let err = validate(None, &[op("a", "b", false)]).unwrap_err();
        assert_eq!(err.reason, EditFailureReason::MissingFile);
    }

    #[test]
    fn sentinel_content_is_editable_by_later_operations() {
        let edits = [op("", "hello world", false), op("world", "there", false)];
        let replay = validate(None, &edits).expect("valid");
        assert!(replay.created);
        assert_eq!(replay.content, "hello there");
        assert_eq!(replay.replacements, vec![1, 1]);
    }

    #[test]
    fn commit_creates_new_file_from_sentinel() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("hello.txt");

        let replay = commit(&path, &[op("", "hello", false)]).expect("commit");
        assert!(replay.created);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");
    }

    #[test]
    fn commit_persists_exactly_the_validated_content() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("lib.rs");
        std::fs::write(&path, "fn old() {}\nfn other() { old() }\n").expect("write");

        let edits = [op("old", "new", true), op("other", "renamed", false)];
        let expected = validate(
            Some(&std::fs::read_to_string(&path).expect("read")),
            &edits,
        )
        .expect("valid");
        let committed = commit(&path, &edits).expect("commit");

        assert_eq!(committed, expected);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), expected.content);
    }

    #[test]
    fn failing_sequence_leaves_file_byte_identical() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("data.txt");
        let original = b"foo bar foo\n\xe2\x9c\x93 done\n";
        std::fs::write(&path, original).expect("write");

        let edits = [op("bar", "BAR", false), op("foo", "baz", false)];
        let err = commit(&path, &edits).unwrap_err();
        assert!(matches!(
            err,
            SubstitutionError::Edit(EditFailure {
                index: 1,
                reason: EditFailureReason::Ambiguous { occurrences: 2 }
            })
        ));
        assert_eq!(std::fs::read(&path).expect("read"), original.to_vec());
    }

    #[test]
    fn commit_rejects_directories_and_binary_files() {
        let tmp = tempdir().expect("tempdir");
        let err = commit(tmp.path(), &[op("a", "b", false)]).unwrap_err();
        assert!(matches!(err, SubstitutionError::NotAFile(_)));

        let bin = tmp.path().join("blob.bin");
        std::fs::write(&bin, [0xff, 0xfe, 0x00]).expect("write");
        let err = commit(&bin, &[op("a", "b", false)]).unwrap_err();
        assert!(matches!(err, SubstitutionError::NotUtf8(_)));
    }

    #[test]
    fn commit_requires_at_least_one_edit() {
        let tmp = tempdir().expect("tempdir");
        let err = commit(&tmp.path().join("x"), &[]).unwrap_err();
        assert!(matches!(err, SubstitutionError::NoEdits));
    }
}
