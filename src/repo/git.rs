//! Git plumbing shared by the local and remote repositories.
//!
//! [`Git`] runs the `git` executable asynchronously. [`WorkTree`] layers the
//! file-operation contract on top of a checked-out working tree: every path
//! goes through the core path guard, content commits exclude the metadata
//! directory, and reverts either apply completely or leave `HEAD` and the
//! tree exactly as they were.

use base64::Engine;
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use walkdir::WalkDir;

use kb_ledger_core::models::METADATA_DIR;
use kb_ledger_core::path;
use kb_ledger_core::repo::{check_metadata_name, CommitInfo, EntryKind, FileEntry};
use kb_ledger_core::{KbError, Result};

use crate::config::GitConfig;

/// Pathspec selecting content only.
const CONTENT_PATHSPEC: [&str; 2] = [".", ":(exclude).kb"];

/// Async `git` runner bound to one working directory.
#[derive(Clone)]
pub struct Git {
    dir: PathBuf,
    author_name: String,
    author_email: String,
    /// `Authorization` header for network commands, passed through the
    /// environment so it never lands in `.git/config` or argv.
    auth_header: Option<String>,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            dir: dir.into(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            auth_header: None,
        }
    }

    /// Attach a token as HTTP basic auth for clone, fetch and push.
    pub fn with_token(mut self, token: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("x-access-token:{}", token));
        self.auth_header = Some(format!("Authorization: Basic {}", encoded));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(cwd)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(["-c", "commit.gpgsign=false", "-c", "core.quotepath=false"])
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(header) = &self.auth_header {
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", header);
        }
        cmd
    }

    /// Run and return the raw output, whatever the exit status.
    pub async fn output_in(&self, cwd: &Path, args: &[&str]) -> Result<Output> {
        self.command(cwd).args(args).output().await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                KbError::Git {
                    command: args.join(" "),
                    stderr: "git executable not found. Is git installed?".to_string(),
                }
            } else {
                KbError::Io(e)
            }
        })
    }

    pub async fn output(&self, args: &[&str]) -> Result<Output> {
        self.output_in(&self.dir, args).await
    }

    /// Run in the working tree; non-zero exit becomes [`KbError::Git`].
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        check(args, output)
    }

    pub async fn succeeds(&self, args: &[&str]) -> Result<bool> {
        Ok(self.output(args).await?.status.success())
    }

    pub async fn head(&self) -> Result<Option<String>> {
        let output = self.output(&["rev-parse", "--verify", "-q", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// `git clone --branch <branch> --single-branch <url> <dir>`.
    pub async fn clone_into(&self, url: &str, branch: &str) -> Result<()> {
        let parent = self.dir.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let dest = self.dir.to_string_lossy().to_string();
        let args = ["clone", "--branch", branch, "--single-branch", url, dest.as_str()];
        let output = self.output_in(parent, &args).await?;
        check(&args[..4], output).map(|_| ())
    }
}

fn check(args: &[&str], output: Output) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(KbError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Cache directory name for a clone URL.
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn io_error(e: std::io::Error, what: &'static str, path: &str) -> KbError {
    if e.kind() == ErrorKind::NotFound {
        KbError::not_found(what, path)
    } else {
        KbError::Io(e)
    }
}

/// A git working tree implementing the repository file contract.
pub struct WorkTree {
    pub git: Git,
}

impl WorkTree {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    pub fn root(&self) -> &Path {
        self.git.dir()
    }

    /// `git init` if the directory is not yet a repository.
    pub async fn ensure_initialized(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root()).await?;
        if !self.root().join(".git").exists() {
            self.git.run(&["init", "-q"]).await?;
        }
        Ok(())
    }

    fn resolve(&self, normalized: &str) -> PathBuf {
        if normalized.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(normalized)
        }
    }

    fn file_target(&self, path: &str) -> Result<(String, PathBuf)> {
        let p = path::guard(path)?;
        if p.is_empty() {
            return Err(KbError::InvalidPath {
                path: path.to_string(),
                reason: "refers to the repository root, not a file".to_string(),
            });
        }
        let full = self.resolve(&p);
        Ok((p, full))
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let (p, full) = self.file_target(path)?;
        if full.is_dir() {
            return Err(KbError::InvalidPath {
                path: p,
                reason: "is a directory".to_string(),
            });
        }
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_error(e, "file", &p))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let (p, full) = self.file_target(path)?;
        if full.is_dir() {
            return Err(KbError::InvalidPath {
                path: p,
                reason: "a directory exists at this path".to_string(),
            });
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let (p, full) = self.file_target(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| io_error(e, "file", &p))
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let p = path::guard(path)?;
        tokio::fs::create_dir_all(self.resolve(&p)).await?;
        Ok(())
    }

    pub async fn delete_directory(&self, path: &str) -> Result<()> {
        let p = path::guard(path)?;
        if p.is_empty() {
            return Err(KbError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the repository root".to_string(),
            });
        }
        tokio::fs::remove_dir_all(self.resolve(&p))
            .await
            .map_err(|e| io_error(e, "directory", &p))
    }

    /// One level, directories first, reserved directories hidden.
    pub async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let p = path::guard(path)?;
        let dir = self.resolve(&p);
        if !dir.is_dir() {
            return Err(KbError::not_found("directory", p));
        }

        let prefix = p.clone();
        let mut entries = tokio::task::spawn_blocking(move || -> Result<Vec<FileEntry>> {
            let mut out = Vec::new();
            for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| KbError::Io(e.into()))?;
                let name = entry.file_name().to_string_lossy().to_string();
                let rel = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                if path::is_reserved(&rel) {
                    continue;
                }
                let kind = if entry.file_type().is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                let size = match kind {
                    EntryKind::File => entry.metadata().ok().map(|m| m.len()),
                    EntryKind::Directory => None,
                };
                out.push(FileEntry {
                    name,
                    path: rel,
                    kind,
                    size,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| KbError::Io(std::io::Error::other(e)))??;

        entries.sort_by(|a, b| {
            let rank = |k: EntryKind| matches!(k, EntryKind::File) as u8;
            rank(a.kind).cmp(&rank(b.kind)).then(a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    /// Stage content (never metadata) and commit, allowing empty commits.
    pub async fn commit(&self, message: &str) -> Result<String> {
        let mut add = vec!["add", "-A", "--"];
        add.extend(CONTENT_PATHSPEC);
        self.git.run(&add).await?;
        self.git
            .run(&["commit", "-q", "--allow-empty", "--no-verify", "-m", message])
            .await?;
        self.head_id().await
    }

    pub async fn commit_metadata(&self, message: &str) -> Result<String> {
        let meta_dir = self.root().join(METADATA_DIR);
        if meta_dir.exists() {
            self.git.run(&["add", "-A", "--", METADATA_DIR]).await?;
        }
        self.git
            .run(&["commit", "-q", "--allow-empty", "--no-verify", "-m", message])
            .await?;
        self.head_id().await
    }

    async fn head_id(&self) -> Result<String> {
        self.git.run(&["rev-parse", "HEAD"]).await
    }

    /// Content paths with uncommitted modifications.
    pub async fn dirty_paths(&self) -> Result<Vec<String>> {
        let mut args = vec!["status", "--porcelain", "--untracked-files=all", "--"];
        args.extend(CONTENT_PATHSPEC);
        let out = self.git.run(&args).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.get(3..))
            .map(|p| p.trim().to_string())
            .collect())
    }

    /// Invert `commit_ids` in the given order as a single new commit.
    pub async fn revert_commits(&self, commit_ids: &[String], message: &str) -> Result<String> {
        if commit_ids.is_empty() {
            return Err(KbError::InvalidEntry(
                "revert requires at least one commit".to_string(),
            ));
        }

        let dirty = self.dirty_paths().await?;
        if !dirty.is_empty() {
            return Err(KbError::RevertConflict { paths: dirty });
        }
        let before = self.git.head().await?;

        let mut args = vec!["revert", "--no-commit", "--no-edit"];
        args.extend(commit_ids.iter().map(String::as_str));
        let output = self.git.output(&args).await?;

        if !output.status.success() {
            let unmerged = self
                .git
                .run(&["diff", "--name-only", "--diff-filter=U"])
                .await
                .unwrap_or_default();
            self.restore(before.as_deref()).await;

            let paths: Vec<String> = unmerged.lines().map(str::to_string).collect();
            if !paths.is_empty() {
                return Err(KbError::RevertConflict { paths });
            }
            return Err(KbError::Git {
                command: "revert --no-commit".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        match self.commit(message).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.restore(before.as_deref()).await;
                Err(e)
            }
        }
    }

    /// Best-effort return to `head` after a failed revert.
    async fn restore(&self, head: Option<&str>) {
        let _ = self.git.output(&["revert", "--abort"]).await;
        self.reset_to(head).await;
    }

    /// Best-effort hard reset of HEAD, index and working tree to `head`.
    pub async fn reset_to(&self, head: Option<&str>) {
        if let Some(head) = head {
            if let Err(e) = self.git.run(&["reset", "-q", "--hard", head]).await {
                tracing::warn!(error = %e, head = %head, "failed to reset working tree");
            }
        }
    }

    pub async fn has_commit(&self, id: &str) -> Result<bool> {
        if id.is_empty() || id.starts_with('-') {
            return Ok(false);
        }
        let spec = format!("{}^{{commit}}", id);
        self.git.succeeds(&["cat-file", "-e", &spec]).await
    }

    pub async fn list_commits(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        if self.git.head().await?.is_none() {
            return Ok(Vec::new());
        }
        let n = limit.to_string();
        let out = self
            .git
            .run(&["log", "-n", &n, "--format=%H%x1f%ct%x1f%s"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\u{1f}');
                let id = parts.next()?.to_string();
                let secs: i64 = parts.next()?.parse().ok()?;
                let message = parts.next().unwrap_or("").to_string();
                let timestamp = Utc.timestamp_opt(secs, 0).single()?;
                Some(CommitInfo {
                    id,
                    message,
                    timestamp,
                })
            })
            .collect())
    }

    fn metadata_file(&self, name: &str) -> Result<PathBuf> {
        check_metadata_name(name)?;
        Ok(self.root().join(METADATA_DIR).join(name))
    }

    pub async fn read_metadata(&self, name: &str) -> Result<Option<String>> {
        let file = self.metadata_file(name)?;
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KbError::Io(e)),
        }
    }

    pub async fn write_metadata(&self, name: &str, content: &str) -> Result<()> {
        let file = self.metadata_file(name)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        Ok(())
    }
}
