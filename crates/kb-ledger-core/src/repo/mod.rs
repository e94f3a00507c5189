//! Repository abstraction.
//!
//! The [`Repository`] trait is the single file-operation contract shared by
//! the local git backend, the remote git backend (both in the application
//! crate), and the in-memory backend in [`memory`].
//!
//! # Contract
//!
//! | Method | Behavior |
//! |--------|----------|
//! | [`read_file`](Repository::read_file) | `NotFound` if absent, `PathProhibited` on reserved paths |
//! | [`write_file`](Repository::write_file) | creates parent directories |
//! | [`list_files`](Repository::list_files) | one level, directories first, `.` is the root |
//! | [`commit`](Repository::commit) | records content (never the metadata dir) as one revision |
//! | [`sync`](Repository::sync) | fast-forward to remote; no-op for local stores |
//! | [`revert_commits`](Repository::revert_commits) | inverts commits, most recent first, as one new revision |
//! | [`read_metadata`](Repository::read_metadata) | control files under `.kb/`, reachable only here |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

/// Message prefix for content revisions created by kb-ledger.
pub const CONTENT_COMMIT_PREFIX: &str = "kb: ";

/// Message prefix for ledger/metadata revisions.
pub const METADATA_COMMIT_PREFIX: &str = "kb-ledger: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry returned by [`Repository::list_files`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Repository-relative path.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pulled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Short label for logs, e.g. `local:/srv/notes`.
    fn describe(&self) -> String;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn delete_directory(&self, path: &str) -> Result<()>;

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Record the current content state as one revision and return its id.
    ///
    /// Always creates a revision, even when nothing changed, so that each
    /// ledger entry owns exactly one commit.
    async fn commit(&self, message: &str) -> Result<String>;

    async fn sync(&self) -> Result<SyncReport>;

    /// Apply the inverse of `commit_ids` (given most recent first) as one
    /// new revision. Fails with [`KbError::RevertConflict`] and leaves the
    /// store untouched if any inverse does not apply cleanly.
    async fn revert_commits(&self, commit_ids: &[String], message: &str) -> Result<String>;

    async fn has_commit(&self, id: &str) -> Result<bool>;

    /// Most recent first.
    async fn list_commits(&self, limit: usize) -> Result<Vec<CommitInfo>>;

    async fn read_metadata(&self, name: &str) -> Result<Option<String>>;

    async fn write_metadata(&self, name: &str, content: &str) -> Result<()>;

    /// Commit only the metadata directory.
    async fn commit_metadata(&self, message: &str) -> Result<String>;

    /// Most recent revision, if any.
    async fn head(&self) -> Result<Option<String>> {
        Ok(self.list_commits(1).await?.into_iter().next().map(|c| c.id))
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        match self.read_file(path).await {
            Ok(_) => Ok(true),
            Err(KbError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Validate a metadata file name: a single plain segment.
pub fn check_metadata_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(KbError::InvalidPath {
            path: name.to_string(),
            reason: "metadata names must be a single plain file name".to_string(),
        });
    }
    Ok(())
}

/// Recursively collect file paths below `root`, sorted.
pub async fn walk_files(repo: &dyn Repository, root: &str) -> Result<Vec<String>> {
    let mut pending = vec![root.to_string()];
    let mut files = Vec::new();

    while let Some(dir) = pending.pop() {
        let entries = match repo.list_files(&dir).await {
            Ok(entries) => entries,
            Err(KbError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => pending.push(entry.path),
                EntryKind::File => files.push(entry.path),
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRepository;
    use super::*;

    #[test]
    fn test_metadata_names() {
        assert!(check_metadata_name("timeline.json").is_ok());
        assert!(check_metadata_name("../x").is_err());
        assert!(check_metadata_name("").is_err());
        assert!(check_metadata_name(".hidden").is_err());
    }

    #[tokio::test]
    async fn test_walk_files_recurses() {
        let repo = MemoryRepository::new("walk");
        repo.write_file("wiki/a.md", "a").await.unwrap();
        repo.write_file("wiki/sub/b.md", "b").await.unwrap();
        repo.write_file("raw/c.md", "c").await.unwrap();

        let files = walk_files(&repo, "wiki").await.unwrap();
        assert_eq!(files, vec!["wiki/a.md", "wiki/sub/b.md"]);

        let missing = walk_files(&repo, "nope").await.unwrap();
        assert!(missing.is_empty());
    }
}
