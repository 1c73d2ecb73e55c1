//! Process-wide record of which files the agents have read.
//!
//! Edit and write tools refuse to touch an existing file until some agent in
//! the process has read it. One ledger is created at start-up and cloned into
//! every tool context, including those of delegated sub-agents.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Default)]
pub struct FileAccessLedger {
    read: Arc<RwLock<HashSet<PathBuf>>>,
}

impl FileAccessLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_read(&self, path: &Path) {
        let key = normalize(path);
        tracing::debug!(path = %key.display(), "marking file as read");
        self.read
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    #[must_use]
    pub fn is_read(&self, path: &Path) -> bool {
        let key = normalize(path);
        self.read
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lexically normalized, then canonical when the file exists on disk.
fn normalize(path: &Path) -> PathBuf {
    let lexical = lexical_normalize(path);
    std::fs::canonicalize(&lexical).unwrap_or(lexical)
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unread_paths_are_not_marked() {
        let ledger = FileAccessLedger::new();
        assert!(!ledger.is_read(Path::new("/nowhere/file.txt")));
        assert!(ledger.is_empty());
    }

    #[test]
    fn equivalent_spellings_share_an_entry() {
        let tmp = tempdir().expect("tempdir");
        let file = tmp.path().join("notes.txt");
        std::fs::write(&file, "x").expect("write");

        let ledger = FileAccessLedger::new();
        ledger.mark_read(&tmp.path().join("./sub/../notes.txt"));
        assert!(ledger.is_read(&file));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let ledger = FileAccessLedger::new();
        let other = ledger.clone();
        other.mark_read(Path::new("/virtual/a.txt"));
        assert!(ledger.is_read(Path::new("/virtual/./a.txt")));
    }

    #[test]
    fn marks_survive_across_threads() {
        let ledger = FileAccessLedger::new();
        let handles: Vec<_> = (0..4)
            .map(|idx| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger.mark_read(Path::new(&format!("/virtual/{idx}.txt")));
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(ledger.len(), 4);
    }
}
