//! In-memory [`Repository`] implementation for tests and embedders.
//!
//! Each commit stores a per-path `(before, after)` diff against the previous
//! committed snapshot, which makes revert an exact inverse: a path can be
//! reverted only while its current content still equals the commit's
//! `after` value. Anything else is a conflict.
//!
//! Sync behaves like a remote: changes queued with
//! [`MemoryRepository::queue_remote_change`] are fast-forwarded in on the
//! next [`sync`](Repository::sync), and [`MemoryRepository::fail_sync`]
//! injects sync failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{check_metadata_name, CommitInfo, EntryKind, FileEntry, Repository, SyncReport};
use crate::error::{KbError, Result};
use crate::path;

type Diff = BTreeMap<String, (Option<String>, Option<String>)>;

/// Injected sync outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFault {
    Conflict(String),
    Failure(String),
}

struct StoredCommit {
    id: String,
    message: String,
    timestamp: DateTime<Utc>,
    content: Diff,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    committed: BTreeMap<String, String>,
    metadata: BTreeMap<String, String>,
    commits: Vec<StoredCommit>,
    remote_queue: Vec<(String, Option<String>)>,
    sync_fault: Option<SyncFault>,
}

/// In-memory repository backed by `BTreeMap`s behind a `RwLock`.
pub struct MemoryRepository {
    label: String,
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: RwLock::new(State::default()),
        }
    }

    /// Make subsequent syncs fail (or succeed again with `None`).
    pub fn fail_sync(&self, fault: Option<SyncFault>) {
        self.write().sync_fault = fault;
    }

    /// Queue a change that "arrives from the remote" on the next sync.
    /// `None` deletes the path.
    pub fn queue_remote_change(&self, path: &str, content: Option<&str>) {
        self.write()
            .remote_queue
            .push((path.to_string(), content.map(str::to_string)));
    }

    pub fn commit_count(&self) -> usize {
        self.read().commits.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn is_dir(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return true;
        }
        let prefix = format!("{}/", dir);
        self.dirs.contains(dir)
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn record_commit(&mut self, message: &str) -> String {
        let mut diff = Diff::new();
        let paths: BTreeSet<&String> = self.files.keys().chain(self.committed.keys()).collect();
        for p in paths {
            let before = self.committed.get(p);
            let after = self.files.get(p);
            if before != after {
                diff.insert(p.clone(), (before.cloned(), after.cloned()));
            }
        }
        self.committed = self.files.clone();
        self.push_commit(message, diff)
    }

    fn push_commit(&mut self, message: &str, content: Diff) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.commits.push(StoredCommit {
            id: id.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
            content,
        });
        id
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let p = path::guard(path)?;
        self.read()
            .files
            .get(&p)
            .cloned()
            .ok_or_else(|| KbError::not_found("file", p))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let p = path::guard(path)?;
        if p.is_empty() {
            return Err(KbError::InvalidPath {
                path: path.to_string(),
                reason: "cannot write to the repository root".to_string(),
            });
        }
        let mut state = self.write();
        if state.is_dir(&p) {
            return Err(KbError::InvalidPath {
                path: p,
                reason: "a directory exists at this path".to_string(),
            });
        }
        state.files.insert(p, content.to_string());
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let p = path::guard(path)?;
        self.write()
            .files
            .remove(&p)
            .map(|_| ())
            .ok_or_else(|| KbError::not_found("file", p))
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let p = path::guard(path)?;
        if !p.is_empty() {
            self.write().dirs.insert(p);
        }
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let p = path::guard(path)?;
        let mut state = self.write();
        if p.is_empty() || !state.is_dir(&p) {
            return Err(KbError::not_found("directory", p));
        }
        let prefix = format!("{}/", p);
        state.files.retain(|f, _| !f.starts_with(&prefix));
        state.dirs.retain(|d| d != &p && !d.starts_with(&prefix));
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let p = path::guard(path)?;
        let state = self.read();
        if !state.is_dir(&p) {
            return Err(KbError::not_found("directory", p));
        }

        let prefix = if p.is_empty() {
            String::new()
        } else {
            format!("{}/", p)
        };

        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut files: Vec<FileEntry> = Vec::new();

        for (f, content) in state.files.iter() {
            let Some(rest) = f.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => files.push(FileEntry {
                    name: rest.to_string(),
                    path: f.clone(),
                    kind: EntryKind::File,
                    size: Some(content.len() as u64),
                }),
            }
        }
        for d in state.dirs.iter() {
            if let Some(rest) = d.strip_prefix(&prefix) {
                let top = rest.split('/').next().unwrap_or(rest);
                if !top.is_empty() {
                    dirs.insert(top.to_string());
                }
            }
        }

        let mut out: Vec<FileEntry> = dirs
            .into_iter()
            .map(|name| FileEntry {
                path: format!("{}{}", prefix, name),
                name,
                kind: EntryKind::Directory,
                size: None,
            })
            .collect();
        out.extend(files);
        Ok(out)
    }

    async fn commit(&self, message: &str) -> Result<String> {
        Ok(self.write().record_commit(message))
    }

    async fn sync(&self) -> Result<SyncReport> {
        let mut state = self.write();
        match &state.sync_fault {
            Some(SyncFault::Conflict(message)) => {
                return Err(KbError::SyncConflict {
                    message: message.clone(),
                })
            }
            Some(SyncFault::Failure(message)) => {
                return Err(KbError::SyncFailure {
                    message: message.clone(),
                })
            }
            None => {}
        }
        if state.remote_queue.is_empty() {
            return Ok(SyncReport { pulled: false });
        }

        // A fast-forward is impossible if local uncommitted work touches an
        // incoming path.
        let blocked = state
            .remote_queue
            .iter()
            .find(|(p, _)| state.files.get(p) != state.committed.get(p))
            .map(|(p, _)| p.clone());
        if let Some(p) = blocked {
            return Err(KbError::SyncConflict {
                message: format!("local uncommitted change to {}", p),
            });
        }

        let incoming: Vec<(String, Option<String>)> = state.remote_queue.drain(..).collect();
        let mut diff = Diff::new();
        for (p, content) in incoming {
            let before = state.committed.get(&p).cloned();
            match &content {
                Some(c) => {
                    state.files.insert(p.clone(), c.clone());
                    state.committed.insert(p.clone(), c.clone());
                }
                None => {
                    state.files.remove(&p);
                    state.committed.remove(&p);
                }
            }
            diff.insert(p, (before, content));
        }
        state.push_commit("remote update", diff);
        Ok(SyncReport { pulled: true })
    }

    async fn revert_commits(&self, commit_ids: &[String], message: &str) -> Result<String> {
        let mut state = self.write();
        let mut work = state.files.clone();
        let mut conflicts: BTreeSet<String> = BTreeSet::new();

        for id in commit_ids {
            let commit = state
                .commits
                .iter()
                .find(|c| &c.id == id)
                .ok_or_else(|| KbError::not_found("commit", id.clone()))?;
            for (p, (before, after)) in &commit.content {
                if work.get(p) != after.as_ref() {
                    conflicts.insert(p.clone());
                    continue;
                }
                match before {
                    Some(c) => {
                        work.insert(p.clone(), c.clone());
                    }
                    None => {
                        work.remove(p);
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            return Err(KbError::RevertConflict {
                paths: conflicts.into_iter().collect(),
            });
        }

        state.files = work;
        Ok(state.record_commit(message))
    }

    async fn has_commit(&self, id: &str) -> Result<bool> {
        Ok(self.read().commits.iter().any(|c| c.id == id))
    }

    async fn list_commits(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        Ok(self
            .read()
            .commits
            .iter()
            .rev()
            .take(limit)
            .map(|c| CommitInfo {
                id: c.id.clone(),
                message: c.message.clone(),
                timestamp: c.timestamp,
            })
            .collect())
    }

    async fn read_metadata(&self, name: &str) -> Result<Option<String>> {
        check_metadata_name(name)?;
        Ok(self.read().metadata.get(name).cloned())
    }

    async fn write_metadata(&self, name: &str, content: &str) -> Result<()> {
        check_metadata_name(name)?;
        self.write()
            .metadata
            .insert(name.to_string(), content.to_string());
        Ok(())
    }

    async fn commit_metadata(&self, message: &str) -> Result<String> {
        Ok(self.write().push_commit(message, Diff::new()))
    }
}
