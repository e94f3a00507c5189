//! Revert execution and recording.
//!
//! Resolve and Plan are pure and live in [`kb_ledger_core::plan`]. This
//! module runs the remaining stages against a repository:
//!
//! 1. **Execute**: invert every planned commit, most recent first, as one
//!    new revision.
//! 2. **Record**: append one ledger entry referencing that revision, then
//!    optionally regenerate pages for sources that are still present.
//!
//! A conflict during Execute leaves the repository as it was, appends an
//! `error` entry and reports `success: false`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kb_ledger_core::history::build_changes;
use kb_ledger_core::models::{
    meta, Actor, Change, ChangeScope, ChangeType, Operation, RevertPlan, RevertResult,
    TimelineEntry,
};
use kb_ledger_core::path;
use kb_ledger_core::plan::{plan, RevertTarget};
use kb_ledger_core::repo::CONTENT_COMMIT_PREFIX;
use kb_ledger_core::KbError;

use crate::ingest::Ingestor;
use crate::ledger::TimelineLedger;
use crate::summarizer::SourceDocument;
use crate::sync::sync_for_write;

/// Parameters of an undo request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRequest {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub change_id: Option<String>,
    #[serde(default)]
    pub last_n_changes: Option<usize>,
    #[serde(default)]
    pub revert_type: ChangeScope,
    #[serde(default)]
    pub regenerate_after_revert: bool,
}

impl UndoRequest {
    pub fn target(&self) -> kb_ledger_core::Result<RevertTarget> {
        RevertTarget::from_selectors(
            self.filename.as_deref(),
            self.change_id.as_deref(),
            self.last_n_changes,
        )
    }
}

pub struct RevertEngine<'a> {
    ingestor: Ingestor<'a>,
}

impl<'a> RevertEngine<'a> {
    pub fn new(ingestor: Ingestor<'a>) -> Self {
        Self { ingestor }
    }

    /// Resolve and plan without touching the repository.
    pub async fn preview(&self, request: &UndoRequest) -> Result<RevertPlan> {
        let target = request.target()?;
        let entries = TimelineLedger::new(self.ingestor.repo).read_all().await?;
        let changes = build_changes(&entries, Utc::now());
        Ok(plan(&entries, &changes, &target, request.revert_type)?)
    }

    pub async fn undo(&self, request: &UndoRequest) -> Result<RevertResult> {
        let repo = self.ingestor.repo;
        let target = request.target()?;
        sync_for_write(repo)
            .await
            .with_context(|| format!("undo in '{}'", self.ingestor.repository.name))?;

        let ledger = TimelineLedger::new(repo);
        let entries = ledger.read_all().await?;
        let changes = build_changes(&entries, Utc::now());
        let plan = plan(&entries, &changes, &target, request.revert_type)?;

        if plan.is_empty() {
            debug!(selector = ?target, skipped = plan.skipped.len(), "nothing to revert");
            let message = if plan.skipped.is_empty() {
                "Nothing to revert".to_string()
            } else {
                format!(
                    "Nothing to revert; {} change(s) already reverted or outside '{}'",
                    plan.skipped.len(),
                    request.revert_type.as_str()
                )
            };
            return Ok(RevertResult {
                success: true,
                message,
                revert_commit_ids: Vec::new(),
                changes_reverted: Vec::new(),
                regeneration_triggered: false,
                regenerated_paths: Vec::new(),
                skipped: plan.skipped,
                warnings: Vec::new(),
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let change_ids: Vec<String> = plan.changes.iter().map(|c| c.id.clone()).collect();
        let commit_message = format!(
            "{}revert {} change(s): {}",
            CONTENT_COMMIT_PREFIX,
            plan.changes.len(),
            change_ids.join(", ")
        );

        let revert_commit = match repo.revert_commits(&plan.commits(), &commit_message).await {
            Ok(id) => id,
            Err(KbError::RevertConflict { paths }) => {
                let message = format!(
                    "Revert aborted: conflicting changes on {}",
                    paths.join(", ")
                );
                warn!(repo = %self.ingestor.repository.name, paths = ?paths, "revert conflict");
                ledger
                    .append(
                        TimelineEntry::new(Actor::System, Operation::Error)
                            .with_request(&request_id)
                            .with_meta(meta::STAGE, meta::STAGE_REVERT)
                            .with_meta(meta::FAILED_STEP, "revert")
                            .with_meta(meta::ERROR, message.as_str())
                            .with_meta(meta::REVERTED_CHANGES, change_ids.clone()),
                    )
                    .await?;
                return Ok(RevertResult {
                    success: false,
                    message,
                    revert_commit_ids: Vec::new(),
                    changes_reverted: Vec::new(),
                    regeneration_triggered: false,
                    regenerated_paths: Vec::new(),
                    skipped: plan.skipped,
                    warnings: Vec::new(),
                });
            }
            Err(e) => return Err(e).context("revert commits"),
        };

        ledger
            .append(record_entry(&plan, &entries, &revert_commit, &request_id, request.revert_type))
            .await?;
        info!(
            repo = %self.ingestor.repository.name,
            commit = %revert_commit,
            changes = plan.changes.len(),
            "reverted"
        );

        let mut result = RevertResult {
            success: true,
            message: format!("Reverted {} change(s)", plan.changes.len()),
            revert_commit_ids: vec![revert_commit],
            changes_reverted: plan.changes.clone(),
            regeneration_triggered: false,
            regenerated_paths: Vec::new(),
            skipped: plan.skipped.clone(),
            warnings: Vec::new(),
        };

        if request.regenerate_after_revert
            && request
                .revert_type
                .includes(ChangeType::KnowledgeBaseGeneration)
        {
            self.regenerate(&plan.changes, &request_id, &mut result)
                .await?;
        }

        Ok(result)
    }

    async fn regenerate(
        &self,
        changes: &[Change],
        request_id: &str,
        result: &mut RevertResult,
    ) -> Result<()> {
        let repo = self.ingestor.repo;
        let ledger = TimelineLedger::new(repo);

        let mut sources: Vec<&str> = Vec::new();
        for change in changes {
            if let Some(src) = change.source_path.as_deref() {
                if !sources.contains(&src) {
                    sources.push(src);
                }
            }
        }

        for src in sources {
            let content = match repo.read_file(src).await {
                Ok(content) => content,
                Err(KbError::NotFound { .. }) => {
                    debug!(source = %src, "source removed; not regenerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            result.regeneration_triggered = true;

            let name = path::file_name(src);
            let title = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
            let source = SourceDocument {
                path: src.to_string(),
                title: title.to_string(),
                content,
            };

            match self.ingestor.write_pages(source).await {
                Ok(pages) => {
                    ledger
                        .append(
                            TimelineEntry::new(Actor::System, Operation::Regen)
                                .with_source(src)
                                .with_commit(&pages.commit)
                                .with_kb_paths(pages.paths.clone())
                                .with_request(request_id)
                                .with_bulk(
                                    pages.paths.len() > self.ingestor.config.ingest.bulk_threshold,
                                )
                                .with_meta(meta::STAGE, meta::STAGE_REGENERATION)
                                .with_meta(meta::REGENERATED_FROM, src)
                                .with_meta(meta::CREATED_PAGES, pages.created.clone()),
                        )
                        .await?;
                    result.regenerated_paths.extend(pages.paths);
                }
                Err(e) => {
                    let message = format!("Regeneration from {} failed: {:#}", src, e);
                    warn!(source = %src, error = %format!("{:#}", e), "regeneration failed");
                    ledger
                        .append(
                            TimelineEntry::new(Actor::System, Operation::Error)
                                .with_source(src)
                                .with_request(request_id)
                                .with_meta(meta::STAGE, meta::STAGE_REGENERATION)
                                .with_meta(meta::FAILED_STEP, "regeneration")
                                .with_meta(meta::ERROR, message.as_str()),
                        )
                        .await?;
                    result.warnings.push(message);
                }
            }
        }
        Ok(())
    }
}

/// The ledger entry recording an executed plan.
///
/// `delete` when any undone upload entry was an `add`, otherwise `update`.
fn record_entry(
    plan: &RevertPlan,
    entries: &[TimelineEntry],
    revert_commit: &str,
    request_id: &str,
    scope: ChangeScope,
) -> TimelineEntry {
    let undone = plan.entry_ids();
    let removed_source = entries.iter().any(|e| {
        e.operation == Operation::Add && e.source_path.is_some() && undone.contains(&e.id)
    });
    let operation = if removed_source {
        Operation::Delete
    } else {
        Operation::Update
    };

    let source = plan
        .changes
        .iter()
        .find(|c| c.change_type == ChangeType::FileUpload)
        .or_else(|| plan.changes.first())
        .and_then(|c| c.source_path.clone());

    let mut kb_paths: Vec<String> = Vec::new();
    for change in &plan.changes {
        if change.change_type == ChangeType::KnowledgeBaseGeneration {
            kb_paths.extend(change.files_affected.iter().cloned());
        }
    }

    let mut entry = TimelineEntry::new(Actor::User, operation)
        .with_commit(revert_commit)
        .with_kb_paths(kb_paths)
        .with_request(request_id)
        .with_bulk(plan.changes.len() > 1)
        .with_meta(meta::STAGE, meta::STAGE_REVERT)
        .with_meta(meta::REVERT_OF, undone)
        .with_meta(
            meta::REVERTED_CHANGES,
            plan.changes.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        )
        .with_meta(meta::REVERT_TYPE, scope.as_str());
    if let Some(source) = source {
        entry = entry.with_source(source);
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingest::IngestInput;
    use crate::summarizer::ExtractiveSummarizer;
    use kb_ledger_core::history::{list_changes, HistoryQuery};
    use kb_ledger_core::models::{RepositoryBackend, RepositoryConfig};
    use kb_ledger_core::repo::memory::MemoryRepository;
    use kb_ledger_core::repo::Repository;

    struct Fixture {
        repo: MemoryRepository,
        repository: RepositoryConfig,
        config: Config,
        summarizer: ExtractiveSummarizer,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repo: MemoryRepository::new("revert"),
                repository: RepositoryConfig::new(
                    "notes",
                    "",
                    RepositoryBackend::Local {
                        path: "/unused".into(),
                    },
                ),
                config: Config::with_state_dir("/tmp/unused"),
                summarizer: ExtractiveSummarizer::new(3),
            }
        }

        fn ingestor(&self) -> Ingestor<'_> {
            Ingestor {
                repo: &self.repo,
                repository: &self.repository,
                config: &self.config,
                summarizer: &self.summarizer,
            }
        }

        fn engine(&self) -> RevertEngine<'_> {
            RevertEngine::new(self.ingestor())
        }

        async fn ingest(&self, title: &str, content: &str) -> crate::ingest::IngestResult {
            self.ingestor()
                .ingest(IngestInput::Text {
                    title: title.into(),
                    content: content.into(),
                })
                .await
                .unwrap()
        }

        async fn active(&self) -> Vec<Change> {
            let entries = TimelineLedger::new(&self.repo).read_all().await.unwrap();
            list_changes(&entries, &HistoryQuery::default(), Utc::now())
        }
    }

    #[tokio::test]
    async fn test_undo_last_two_removes_everything() {
        let fx = Fixture::new();
        let ingested = fx.ingest("Note", "Hello world.").await;
        assert_eq!(fx.active().await.len(), 2);

        let result = fx
            .engine()
            .undo(&UndoRequest {
                last_n_changes: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.changes_reverted.len(), 2);
        assert_eq!(result.revert_commit_ids.len(), 1);
        assert!(fx.active().await.is_empty());
        assert!(!fx.repo.file_exists(&ingested.raw_path).await.unwrap());
        assert!(!fx
            .repo
            .file_exists(&ingested.knowledge_base_paths[0])
            .await
            .unwrap());

        let entries = TimelineLedger::new(&fx.repo).read_all().await.unwrap();
        let record = entries.last().unwrap();
        assert_eq!(record.operation, Operation::Delete);
        assert_eq!(record.revert_targets().len(), 2);
        assert_eq!(record.meta[meta::REVERT_TYPE], "both");
    }

    #[tokio::test]
    async fn test_kb_only_revert_keeps_source() {
        let fx = Fixture::new();
        let ingested = fx.ingest("Note", "Hello world.").await;
        let kb_change = fx
            .active()
            .await
            .into_iter()
            .find(|c| c.change_type == ChangeType::KnowledgeBaseGeneration)
            .unwrap();

        let result = fx
            .engine()
            .undo(&UndoRequest {
                change_id: Some(kb_change.id.clone()),
                revert_type: ChangeScope::KnowledgeBaseGeneration,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            fx.repo.read_file(&ingested.raw_path).await.unwrap(),
            "Hello world."
        );
        assert!(!fx
            .repo
            .file_exists(&ingested.knowledge_base_paths[0])
            .await
            .unwrap());

        let entries = TimelineLedger::new(&fx.repo).read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().operation, Operation::Update);
    }

    #[tokio::test]
    async fn test_repeated_undo_is_a_successful_noop() {
        let fx = Fixture::new();
        fx.ingest("Note", "Hello world.").await;
        let upload = fx
            .active()
            .await
            .into_iter()
            .find(|c| c.change_type == ChangeType::FileUpload)
            .unwrap();
        let request = UndoRequest {
            change_id: Some(upload.id.clone()),
            ..Default::default()
        };

        let first = fx.engine().undo(&request).await.unwrap();
        assert!(first.success);
        assert_eq!(first.changes_reverted.len(), 2);

        let commits = fx.repo.commit_count();
        let second = fx.engine().undo(&request).await.unwrap();
        assert!(second.success);
        assert!(second.changes_reverted.is_empty());
        assert_eq!(second.skipped, vec![upload.id]);
        assert_eq!(fx.repo.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_conflict_reports_failure_and_records_error() {
        let fx = Fixture::new();
        fx.ingest("Note", "Hello world.").await;
        let first_upload = fx
            .active()
            .await
            .into_iter()
            .find(|c| c.change_type == ChangeType::FileUpload)
            .unwrap();
        fx.ingest("Note", "Hello again.").await;

        let result = fx
            .engine()
            .undo(&UndoRequest {
                change_id: Some(first_upload.id),
                revert_type: ChangeScope::FileUpload,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("raw/note.md"));
        assert_eq!(
            fx.repo.read_file("raw/note.md").await.unwrap(),
            "Hello again."
        );

        let entries = TimelineLedger::new(&fx.repo).read_all().await.unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.operation, Operation::Error);
        assert_eq!(last.meta[meta::FAILED_STEP], "revert");
        assert_eq!(fx.active().await.len(), 4);
    }

    #[tokio::test]
    async fn test_regenerate_after_kb_revert() {
        let fx = Fixture::new();
        let ingested = fx.ingest("Note", "Hello world.").await;

        let result = fx
            .engine()
            .undo(&UndoRequest {
                last_n_changes: Some(1),
                revert_type: ChangeScope::KnowledgeBaseGeneration,
                regenerate_after_revert: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.regeneration_triggered);
        assert_eq!(result.regenerated_paths, ingested.knowledge_base_paths);
        assert!(fx
            .repo
            .file_exists(&ingested.knowledge_base_paths[0])
            .await
            .unwrap());

        let entries = TimelineLedger::new(&fx.repo).read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().operation, Operation::Regen);
    }

    struct Unavailable;

    #[async_trait::async_trait]
    impl crate::summarizer::Summarizer for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }
        async fn generate(
            &self,
            _request: &crate::summarizer::GenerationRequest,
        ) -> Result<Vec<crate::summarizer::KbPage>> {
            anyhow::bail!("summarizer offline")
        }
        async fn answer(
            &self,
            _question: &str,
            _pages: &[SourceDocument],
        ) -> Result<crate::summarizer::Answer> {
            anyhow::bail!("summarizer offline")
        }
    }

    #[tokio::test]
    async fn test_regeneration_failure_is_a_warning() {
        let fx = Fixture::new();
        let ingested = fx.ingest("Note", "Hello world.").await;

        let offline = Unavailable;
        let engine = RevertEngine::new(Ingestor {
            repo: &fx.repo,
            repository: &fx.repository,
            config: &fx.config,
            summarizer: &offline,
        });
        let result = engine
            .undo(&UndoRequest {
                last_n_changes: Some(1),
                revert_type: ChangeScope::KnowledgeBaseGeneration,
                regenerate_after_revert: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.regeneration_triggered);
        assert!(result.regenerated_paths.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("summarizer offline"));

        // The revert itself stands; only the source remains.
        assert!(fx.repo.file_exists(&ingested.raw_path).await.unwrap());
        assert!(!fx
            .repo
            .file_exists(&ingested.knowledge_base_paths[0])
            .await
            .unwrap());

        let entries = TimelineLedger::new(&fx.repo).read_all().await.unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.operation, Operation::Error);
        assert_eq!(last.meta[meta::FAILED_STEP], "regeneration");
        assert_eq!(last.source_path.as_deref(), Some(ingested.raw_path.as_str()));
        assert!(entries[entries.len() - 2].is_revert_record());
    }

    #[tokio::test]
    async fn test_preview_does_not_mutate() {
        let fx = Fixture::new();
        fx.ingest("Note", "Hello world.").await;
        let commits = fx.repo.commit_count();

        let plan = fx
            .engine()
            .preview(&UndoRequest {
                filename: Some("note.md".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.commits().len(), 2);
        assert_eq!(fx.repo.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_ambiguous_target_is_rejected() {
        let fx = Fixture::new();
        let err = fx
            .engine()
            .undo(&UndoRequest {
                filename: Some("a.md".into()),
                last_n_changes: Some(1),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::AmbiguousRevertTarget { supplied: 2 })
        ));
    }
}
