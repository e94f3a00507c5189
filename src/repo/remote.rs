//! Remote git-hosted repository, worked on through a cached local clone.
//!
//! The clone lives under the storage clone directory, keyed by a hash of
//! the remote URL and branch. Every commit is pushed to the tracked branch
//! before it is reported, so a returned commit id exists remotely. A commit
//! whose push fails is rolled back, leaving the clone at the last pushed
//! revision.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use kb_ledger_core::repo::{CommitInfo, FileEntry, Repository, SyncReport};
use kb_ledger_core::{KbError, Result};

use super::git::{short_hash, Git, WorkTree};
use crate::config::Config;

/// Where a remote repository lives and how to reach it.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub owner: String,
    pub repo_name: String,
    pub branch: String,
}

impl RemoteSpec {
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}.git",
            base_url.trim_end_matches('/'),
            self.owner,
            self.repo_name
        )
    }
}

pub struct RemoteRepository {
    tree: WorkTree,
    url: String,
    branch: String,
}

impl RemoteRepository {
    /// Clone on first use; later opens reuse the cached clone.
    pub async fn open(spec: &RemoteSpec, token: &str, config: &Config) -> Result<Self> {
        let url = spec.url(&config.git.remote_base_url);
        let dir: PathBuf = config
            .storage
            .clone_dir()
            .join(short_hash(&format!("{}#{}", url, spec.branch)));
        let git = Git::new(&dir, &config.git).with_token(token);
        let tree = WorkTree::new(git);

        if !dir.join(".git").exists() {
            info!(url = %url, branch = %spec.branch, dir = %dir.display(), "cloning remote repository");
            tree.git.clone_into(&url, &spec.branch).await.map_err(|e| match e {
                KbError::Git { stderr, .. } => KbError::SyncFailure {
                    message: format!("clone of {} failed: {}", url, stderr),
                },
                other => other,
            })?;
        }

        Ok(Self {
            tree,
            url,
            branch: spec.branch.clone(),
        })
    }

    fn remote_ref(&self) -> String {
        format!("origin/{}", self.branch)
    }

    async fn push(&self) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        self.tree
            .git
            .run(&["push", "-q", "origin", &refspec])
            .await
            .map_err(|e| KbError::SyncFailure {
                message: format!("push to {} ({}) failed: {}", self.url, self.branch, e),
            })?;
        debug!(url = %self.url, "pushed");
        Ok(())
    }

    /// Push the commit `id` made on top of `before`, or undo it locally.
    async fn publish(&self, before: Option<String>, id: String) -> Result<String> {
        if let Err(e) = self.push().await {
            warn!(url = %self.url, commit = %id, "push failed; rolling back local commit");
            self.tree.reset_to(before.as_deref()).await;
            return Err(e);
        }
        Ok(id)
    }
}

#[async_trait]
impl Repository for RemoteRepository {
    fn describe(&self) -> String {
        format!("remote:{}#{}", self.url, self.branch)
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
        let before = self.tree.git.head().await?;
        let id = self.tree.commit(message).await?;
        self.publish(before, id).await
    }

    /// Fetch and fast-forward. Refuses when local content is uncommitted
    /// or when history has diverged.
    async fn sync(&self) -> Result<SyncReport> {
        let dirty = self.tree.dirty_paths().await?;
        if !dirty.is_empty() {
            return Err(KbError::SyncConflict {
                message: format!("uncommitted local changes: {}", dirty.join(", ")),
            });
        }

        self.tree
            .git
            .run(&["fetch", "-q", "origin", &self.branch])
            .await
            .map_err(|e| KbError::SyncFailure {
                message: format!("fetch from {} failed: {}", self.url, e),
            })?;

        let remote_ref = self.remote_ref();
        let before = self.tree.git.head().await?;
        let remote = self.tree.git.run(&["rev-parse", &remote_ref]).await?;
        if before.as_deref() == Some(remote.as_str()) {
            return Ok(SyncReport { pulled: false });
        }

        self.tree
            .git
            .run(&["merge", "-q", "--ff-only", &remote_ref])
            .await
            .map_err(|e| KbError::SyncConflict {
                message: format!("cannot fast-forward to {}: {}", remote_ref, e),
            })?;

        let after = self.tree.git.head().await?;
        Ok(SyncReport {
            pulled: after != before,
        })
    }

    async fn revert_commits(&self, commit_ids: &[String], message: &str) -> Result<String> {
        let before = self.tree.git.head().await?;
        let id = self.tree.revert_commits(commit_ids, message).await?;
        self.publish(before, id).await
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
        let before = self.tree.git.head().await?;
        let id = self.tree.commit_metadata(message).await?;
        self.publish(before, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=t", "-c", "user.email=t@t"])
            .args(args)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Bare origin at `<tmp>/remotes/acme/handbook.git` seeded with one commit
    /// on `main`, plus a config whose base URL points at it.
    fn fixture() -> Option<(TempDir, Config, RemoteSpec)> {
        let tmp = TempDir::new().unwrap();
        let remotes = tmp.path().join("remotes");
        let origin = remotes.join("acme").join("handbook.git");
        std::fs::create_dir_all(&origin).unwrap();
        if !git(&origin, &["init", "-q", "--bare", "-b", "main"]) {
            return None;
        }

        let seed = tmp.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("README.md"), "handbook\n").unwrap();
        let origin_str = origin.to_string_lossy().to_string();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["add", "-A"],
            vec!["commit", "-q", "-m", "seed"],
            vec!["push", "-q", origin_str.as_str(), "main"],
        ] {
            if !git(&seed, &args) {
                return None;
            }
        }

        let mut config = Config::with_state_dir(tmp.path().join("state"));
        config.git.remote_base_url = remotes.to_string_lossy().to_string();
        let spec = RemoteSpec {
            owner: "acme".into(),
            repo_name: "handbook".into(),
            branch: "main".into(),
        };
        Some((tmp, config, spec))
    }

    #[tokio::test]
    async fn test_clone_commit_pushes_and_sync_pulls() {
        let Some((tmp, config, spec)) = fixture() else {
            return;
        };
        let repo = RemoteRepository::open(&spec, "token", &config).await.unwrap();
        assert_eq!(repo.read_file("README.md").await.unwrap(), "handbook\n");
        assert!(!repo.sync().await.unwrap().pulled);

        repo.write_file("raw/a.md", "a").await.unwrap();
        repo.commit("kb: add a").await.unwrap();

        // A second clone elsewhere sees the pushed commit and adds its own.
        let mut other_config = config.clone();
        other_config.storage.cache_dir = Some(tmp.path().join("other-cache"));
        let other = RemoteRepository::open(&spec, "token", &other_config)
            .await
            .unwrap();
        assert_eq!(other.read_file("raw/a.md").await.unwrap(), "a");
        other.write_file("raw/b.md", "b").await.unwrap();
        other.commit("kb: add b").await.unwrap();

        assert!(repo.sync().await.unwrap().pulled);
        assert_eq!(repo.read_file("raw/b.md").await.unwrap(), "b");
    }

    /// Make the bare origin reject every push.
    #[cfg(unix)]
    fn reject_pushes(tmp: &TempDir) {
        use std::os::unix::fs::PermissionsExt;
        let hook = tmp
            .path()
            .join("remotes/acme/handbook.git/hooks/pre-receive");
        std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
        std::fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_push_rolls_back_local_commits() {
        let Some((tmp, config, spec)) = fixture() else {
            return;
        };
        let repo = RemoteRepository::open(&spec, "token", &config).await.unwrap();
        repo.write_file("raw/a.md", "a").await.unwrap();
        let added = repo.commit("kb: add a").await.unwrap();

        reject_pushes(&tmp);
        let head = repo.tree.git.head().await.unwrap();

        // Revert
        let err = repo
            .revert_commits(&[added.clone()], "kb: revert add a")
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::SyncFailure { .. }));
        assert_eq!(repo.tree.git.head().await.unwrap(), head);
        assert_eq!(repo.read_file("raw/a.md").await.unwrap(), "a");
        assert!(repo.tree.dirty_paths().await.unwrap().is_empty());

        // Content commit
        repo.write_file("raw/b.md", "b").await.unwrap();
        let err = repo.commit("kb: add b").await.unwrap_err();
        assert!(matches!(err, KbError::SyncFailure { .. }));
        assert_eq!(repo.tree.git.head().await.unwrap(), head);
        assert!(matches!(
            repo.read_file("raw/b.md").await.unwrap_err(),
            KbError::NotFound { .. }
        ));

        // Metadata commit
        repo.write_metadata("timeline.json", "{\"entries\":[]}")
            .await
            .unwrap();
        assert!(repo.commit_metadata("kb-ledger: timeline").await.is_err());
        assert_eq!(repo.tree.git.head().await.unwrap(), head);
        assert_eq!(repo.read_metadata("timeline.json").await.unwrap(), None);

        // The clone is still in step with the remote.
        assert!(!repo.sync().await.unwrap().pulled);
    }

    #[tokio::test]
    async fn test_sync_refuses_dirty_tree() {
        let Some((_tmp, config, spec)) = fixture() else {
            return;
        };
        let repo = RemoteRepository::open(&spec, "token", &config).await.unwrap();
        repo.write_file("raw/wip.md", "draft").await.unwrap();
        let err = repo.sync().await.unwrap_err();
        assert!(matches!(err, KbError::SyncConflict { .. }));
    }

    #[tokio::test]
    async fn test_missing_remote_is_sync_failure() {
        let Some((_tmp, config, _)) = fixture() else {
            return;
        };
        let spec = RemoteSpec {
            owner: "acme".into(),
            repo_name: "missing".into(),
            branch: "main".into(),
        };
        let err = RemoteRepository::open(&spec, "token", &config)
            .await
            .err()
            .unwrap();
        assert!(err.is_sync_error());
    }
}
