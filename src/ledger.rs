//! Append-only timeline ledger.
//!
//! The ledger is a JSON document (`{"entries": [...]}`) stored in the
//! repository's metadata directory and committed separately from content.
//! Entries are only ever appended; a revert is a new entry, never an edit.
//!
//! # Consistency
//!
//! An entry is appended only after the content commit it references has
//! returned, and [`TimelineLedger::append`] checks that the commit exists.
//! A crash between the two leaves a commit without an entry, which
//! [`TimelineLedger::reconcile`] reports.

use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use kb_ledger_core::models::{LedgerDocument, Operation, TimelineEntry, LEDGER_FILE};
use kb_ledger_core::repo::{
    CommitInfo, Repository, CONTENT_COMMIT_PREFIX, METADATA_COMMIT_PREFIX,
};
use kb_ledger_core::{KbError, Result};

pub struct TimelineLedger<'a> {
    repo: &'a dyn Repository,
}

/// Outcome of comparing the ledger with revision history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub entries: usize,
    /// `(entry id, commit)` pairs whose commit is absent from the store.
    pub missing_commits: Vec<(String, String)>,
    /// Content commits no entry references.
    pub unrecorded_commits: Vec<CommitInfo>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_commits.is_empty() && self.unrecorded_commits.is_empty()
    }
}

impl<'a> TimelineLedger<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// All entries, oldest first. A missing ledger is empty.
    pub async fn read_all(&self) -> Result<Vec<TimelineEntry>> {
        match self.repo.read_metadata(LEDGER_FILE).await? {
            None => Ok(Vec::new()),
            Some(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Some(raw) => {
                let doc: LedgerDocument = serde_json::from_str(&raw)?;
                Ok(doc.entries)
            }
        }
    }

    /// Validate and append one entry, returning it as stored.
    pub async fn append(&self, mut entry: TimelineEntry) -> Result<TimelineEntry> {
        let mut entries = self.read_all().await?;

        if entry.id.trim().is_empty() {
            return Err(KbError::InvalidEntry("id must not be empty".to_string()));
        }
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(KbError::InvalidEntry(format!(
                "duplicate entry id {}",
                entry.id
            )));
        }
        if entry.operation == Operation::Error {
            if !entry.commit.is_empty() && !self.repo.has_commit(&entry.commit).await? {
                return Err(KbError::not_found("commit", entry.commit.clone()));
            }
        } else {
            if entry.commit.is_empty() {
                return Err(KbError::InvalidEntry(format!(
                    "{} entry {} has no commit",
                    entry.operation, entry.id
                )));
            }
            if !self.repo.has_commit(&entry.commit).await? {
                return Err(KbError::not_found("commit", entry.commit.clone()));
            }
        }

        let mut seen = HashSet::new();
        entry.affected_kb_paths.retain(|p| seen.insert(p.clone()));

        if let Some(last) = entries.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }

        entries.push(entry.clone());
        let doc = LedgerDocument { entries };
        self.repo
            .write_metadata(LEDGER_FILE, &serde_json::to_string_pretty(&doc)?)
            .await?;
        self.repo
            .commit_metadata(&format!(
                "{}record {} {}",
                METADATA_COMMIT_PREFIX, entry.operation, entry.id
            ))
            .await?;

        debug!(
            repo = %self.repo.describe(),
            id = %entry.id,
            operation = %entry.operation,
            commit = %entry.commit,
            "timeline entry appended"
        );
        Ok(entry)
    }

    /// Compare entry commits with the last `depth` revisions.
    pub async fn reconcile(&self, depth: usize) -> Result<ReconcileReport> {
        let entries = self.read_all().await?;

        let mut missing_commits = Vec::new();
        for e in &entries {
            if !e.commit.is_empty() && !self.repo.has_commit(&e.commit).await? {
                missing_commits.push((e.id.clone(), e.commit.clone()));
            }
        }

        let referenced: HashSet<&str> = entries.iter().map(|e| e.commit.as_str()).collect();
        let unrecorded_commits = self
            .repo
            .list_commits(depth)
            .await?
            .into_iter()
            .filter(|c| c.message.starts_with(CONTENT_COMMIT_PREFIX))
            .filter(|c| !referenced.contains(c.id.as_str()))
            .collect();

        Ok(ReconcileReport {
            entries: entries.len(),
            missing_commits,
            unrecorded_commits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kb_ledger_core::models::{meta, Actor};
    use kb_ledger_core::repo::memory::MemoryRepository;

    async fn committed(repo: &MemoryRepository, path: &str) -> String {
        repo.write_file(path, "x").await.unwrap();
        repo.commit(&format!("{}add {}", CONTENT_COMMIT_PREFIX, path))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let repo = MemoryRepository::new("ledger");
        let ledger = TimelineLedger::new(&repo);
        assert!(ledger.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_clamps_time() {
        let repo = MemoryRepository::new("ledger");
        let ledger = TimelineLedger::new(&repo);

        let c1 = committed(&repo, "raw/a.md").await;
        let first = ledger
            .append(
                TimelineEntry::new(Actor::User, Operation::Add)
                    .with_source("raw/a.md")
                    .with_commit(&c1),
            )
            .await
            .unwrap();

        let c2 = committed(&repo, "raw/b.md").await;
        let earlier = first.timestamp - Duration::seconds(30);
        let second = ledger
            .append(
                TimelineEntry::new(Actor::User, Operation::Add)
                    .with_source("raw/b.md")
                    .with_commit(&c2)
                    .with_timestamp(earlier),
            )
            .await
            .unwrap();
        assert_eq!(second.timestamp, first.timestamp);

        let all = ledger.read_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_or_missing_commit() {
        let repo = MemoryRepository::new("ledger");
        let ledger = TimelineLedger::new(&repo);

        let err = ledger
            .append(TimelineEntry::new(Actor::User, Operation::Add))
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::InvalidEntry(_)));

        let err = ledger
            .append(TimelineEntry::new(Actor::User, Operation::Add).with_commit("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::NotFound { .. }));

        // Error entries may omit the commit.
        ledger
            .append(
                TimelineEntry::new(Actor::System, Operation::Error)
                    .with_meta(meta::ERROR, "summarizer unavailable"),
            )
            .await
            .unwrap();
        assert_eq!(ledger.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_kb_paths_collapse() {
        let repo = MemoryRepository::new("ledger");
        let ledger = TimelineLedger::new(&repo);
        let c = committed(&repo, "wiki/a.md").await;
        let stored = ledger
            .append(
                TimelineEntry::new(Actor::System, Operation::Update)
                    .with_commit(&c)
                    .with_kb_paths(vec!["wiki/a.md".into(), "wiki/a.md".into()]),
            )
            .await
            .unwrap();
        assert_eq!(stored.affected_kb_paths, vec!["wiki/a.md"]);
    }

    #[tokio::test]
    async fn test_reconcile_finds_unrecorded_commit() {
        let repo = MemoryRepository::new("ledger");
        let ledger = TimelineLedger::new(&repo);

        let c1 = committed(&repo, "raw/a.md").await;
        ledger
            .append(TimelineEntry::new(Actor::User, Operation::Add).with_commit(&c1))
            .await
            .unwrap();
        assert!(ledger.reconcile(100).await.unwrap().is_consistent());

        // Simulate a crash between commit and append.
        let orphan = committed(&repo, "raw/b.md").await;
        let report = ledger.reconcile(100).await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(report.unrecorded_commits.len(), 1);
        assert_eq!(report.unrecorded_commits[0].id, orphan);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_an_error() {
        let repo = MemoryRepository::new("ledger");
        repo.write_metadata(LEDGER_FILE, "{not json").await.unwrap();
        let err = TimelineLedger::new(&repo).read_all().await.unwrap_err();
        assert!(matches!(err, KbError::Serialization(_)));
    }
}
