//! Git working tree in a local directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use kb_ledger_core::repo::{CommitInfo, FileEntry, Repository, SyncReport};
use kb_ledger_core::Result;

use super::git::{Git, WorkTree};
use crate::config::GitConfig;

pub struct LocalRepository {
    tree: WorkTree,
}

impl LocalRepository {
    /// Open `path`, running `git init` on first use.
    pub async fn open(path: &Path, config: &GitConfig) -> Result<Self> {
        let tree = WorkTree::new(Git::new(path, config));
        tree.ensure_initialized().await?;
        Ok(Self { tree })
    }

    pub fn root(&self) -> PathBuf {
        self.tree.root().to_path_buf()
    }
}

#[async_trait]
impl Repository for LocalRepository {
    fn describe(&self) -> String {
        format!("local:{}", self.tree.root().display())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.tree.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.tree.write_file(path, content).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.tree.delete_file(path).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.tree.create_directory(path).await
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.tree.delete_directory(path).await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.tree.list_files(path).await
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.tree.commit(message).await
    }

    async fn sync(&self) -> Result<SyncReport> {
        Ok(SyncReport { pulled: false })
    }

    async fn revert_commits(&self, commit_ids: &[String], message: &str) -> Result<String> {
        self.tree.revert_commits(commit_ids, message).await
    }

    async fn has_commit(&self, id: &str) -> Result<bool> {
        self.tree.has_commit(id).await
    }

    async fn list_commits(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        self.tree.list_commits(limit).await
    }

    async fn read_metadata(&self, name: &str) -> Result<Option<String>> {
        self.tree.read_metadata(name).await
    }

    async fn write_metadata(&self, name: &str, content: &str) -> Result<()> {
        self.tree.write_metadata(name, content).await
    }

    async fn commit_metadata(&self, message: &str) -> Result<String> {
        self.tree.commit_metadata(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_ledger_core::repo::EntryKind;
    use kb_ledger_core::KbError;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn open() -> Option<(TempDir, LocalRepository)> {
        if !git_available() {
            return None;
        }
        let tmp = TempDir::new().unwrap();
        let repo = LocalRepository::open(&tmp.path().join("kb"), &GitConfig::default())
            .await
            .unwrap();
        Some((tmp, repo))
    }

    #[tokio::test]
    async fn test_write_commit_and_revert() {
        let Some((_tmp, repo)) = open().await else {
            return;
        };
        repo.write_file("raw/a.md", "one").await.unwrap();
        let c1 = repo.commit("kb: add a").await.unwrap();
        assert!(repo.has_commit(&c1).await.unwrap());

        repo.write_file("raw/a.md", "two").await.unwrap();
        let c2 = repo.commit("kb: update a").await.unwrap();

        repo.revert_commits(&[c2.clone()], "kb: revert").await.unwrap();
        assert_eq!(repo.read_file("raw/a.md").await.unwrap(), "one");

        repo.revert_commits(&[c1], "kb: revert add").await.unwrap();
        assert!(matches!(
            repo.read_file("raw/a.md").await,
            Err(KbError::NotFound { .. })
        ));

        let commits = repo.list_commits(10).await.unwrap();
        assert_eq!(commits.len(), 4);
        assert_eq!(commits[0].message, "kb: revert add");
    }

    #[tokio::test]
    async fn test_revert_conflict_restores_tree() {
        let Some((_tmp, repo)) = open().await else {
            return;
        };
        repo.write_file("raw/a.md", "one\n").await.unwrap();
        let c1 = repo.commit("kb: add").await.unwrap();
        repo.write_file("raw/a.md", "two\n").await.unwrap();
        repo.commit("kb: edit").await.unwrap();
        let head = repo.head().await.unwrap();

        let err = repo.revert_commits(&[c1], "kb: revert").await.unwrap_err();
        match err {
            KbError::RevertConflict { paths } => assert_eq!(paths, vec!["raw/a.md"]),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(repo.head().await.unwrap(), head);
        assert_eq!(repo.read_file("raw/a.md").await.unwrap(), "two\n");
    }

    #[tokio::test]
    async fn test_metadata_stays_out_of_content_commits() {
        let Some((_tmp, repo)) = open().await else {
            return;
        };
        repo.write_metadata("timeline.json", "{}").await.unwrap();
        repo.write_file("raw/a.md", "a").await.unwrap();
        let content = repo.commit("kb: add").await.unwrap();
        repo.commit_metadata("kb-ledger: record").await.unwrap();

        repo.revert_commits(&[content], "kb: revert").await.unwrap();
        assert_eq!(
            repo.read_metadata("timeline.json").await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_reserved_paths_and_listing() {
        let Some((_tmp, repo)) = open().await else {
            return;
        };
        assert!(matches!(
            repo.read_file(".git/config").await,
            Err(KbError::PathProhibited { .. })
        ));
        assert!(matches!(
            repo.write_file(".kb/timeline.json", "x").await,
            Err(KbError::PathProhibited { .. })
        ));

        repo.write_file("b.md", "b").await.unwrap();
        repo.write_file("wiki/a.md", "a").await.unwrap();
        repo.write_metadata("timeline.json", "{}").await.unwrap();

        let entries = repo.list_files(".").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["wiki", "b.md"]);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].size, Some(1));
    }
}
