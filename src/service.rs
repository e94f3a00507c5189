//! The knowledge service: every user-facing operation in one place.
//!
//! [`KnowledgeService`] is constructed once at startup and passed by
//! reference to the CLI and both transports. It owns the configuration,
//! the repository registry, the summarizer and an [`AdapterFactory`].
//!
//! # Concurrency
//!
//! Each repository has one `tokio::sync::Mutex`, keyed by repository id.
//! Every operation on a repository (including reads, which sync first)
//! holds that lock for its whole duration, so ingest, revert and history
//! never interleave within a repository. Different repositories proceed in
//! parallel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use kb_ledger_core::history::{list_changes, HistoryQuery};
use kb_ledger_core::models::{Change, RepositoryBackend, RepositoryConfig, RevertPlan, RevertResult};
use kb_ledger_core::path;
use kb_ledger_core::repo::memory::MemoryRepository;
use kb_ledger_core::repo::{walk_files, FileEntry, Repository};
use kb_ledger_core::KbError;

use crate::config::Config;
use crate::ingest::{IngestInput, IngestResult, Ingestor};
use crate::ledger::{ReconcileReport, TimelineLedger};
use crate::registry::{resolve_credential, NewRepository, RepositoryRegistry};
use crate::repo::{LocalRepository, RemoteRepository, RemoteSpec};
use crate::revert::{RevertEngine, UndoRequest};
use crate::summarizer::{answer_with_timeout, create_summarizer, SourceDocument, Summarizer};
use crate::sync::sync_for_read;

// ============ Adapter factories ============

/// Opens the storage backend for a registered repository.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open(
        &self,
        repository: &RepositoryConfig,
        config: &Config,
    ) -> Result<Arc<dyn Repository>>;
}

/// Git working trees: local directories and cached remote clones.
pub struct GitAdapterFactory;

#[async_trait]
impl AdapterFactory for GitAdapterFactory {
    async fn open(
        &self,
        repository: &RepositoryConfig,
        config: &Config,
    ) -> Result<Arc<dyn Repository>> {
        match &repository.backend {
            RepositoryBackend::Local { path } => {
                let repo = LocalRepository::open(path, &config.git)
                    .await
                    .with_context(|| format!("open local repository {}", path.display()))?;
                Ok(Arc::new(repo))
            }
            RepositoryBackend::Remote {
                owner,
                repo_name,
                branch,
                credential_alias,
            } => {
                let token = resolve_credential(config, credential_alias)?;
                let spec = RemoteSpec {
                    owner: owner.clone(),
                    repo_name: repo_name.clone(),
                    branch: branch.clone(),
                };
                let repo = RemoteRepository::open(&spec, &token, config)
                    .await
                    .with_context(|| format!("open remote repository {}/{}", owner, repo_name))?;
                Ok(Arc::new(repo))
            }
        }
    }
}

/// In-memory repositories, one per registered repository.
pub struct MemoryAdapterFactory;

#[async_trait]
impl AdapterFactory for MemoryAdapterFactory {
    async fn open(
        &self,
        repository: &RepositoryConfig,
        _config: &Config,
    ) -> Result<Arc<dyn Repository>> {
        Ok(Arc::new(MemoryRepository::new(repository.name.clone())))
    }
}

// ============ Operation results ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseOp {
    ListDirectory,
    ReadFile,
}

impl FromStr for BrowseOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "list_directory" => Ok(BrowseOp::ListDirectory),
            "read_file" => Ok(BrowseOp::ReadFile),
            other => Err(format!(
                "unknown browse operation '{}': expected list_directory or read_file",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseResult {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub answer: String,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResult {
    pub changes: Vec<Change>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

// ============ Service ============

type Slot = Arc<Mutex<Option<Arc<dyn Repository>>>>;

/// A repository opened and locked for the duration of one operation.
struct Locked {
    repository: RepositoryConfig,
    repo: Arc<dyn Repository>,
    _guard: OwnedMutexGuard<Option<Arc<dyn Repository>>>,
}

pub struct KnowledgeService {
    config: Config,
    registry: RwLock<RepositoryRegistry>,
    summarizer: Arc<dyn Summarizer>,
    factory: Arc<dyn AdapterFactory>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl KnowledgeService {
    pub fn new(
        config: Config,
        registry: RepositoryRegistry,
        summarizer: Arc<dyn Summarizer>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(registry),
            summarizer,
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: registry file from `storage.state_dir`, summarizer
    /// from `[summarizer]`, git-backed repositories.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = RepositoryRegistry::load(config.storage.registry_file()).with_context(
            || format!("load registry {}", config.storage.registry_file().display()),
        )?;
        let summarizer = create_summarizer(&config.summarizer)?;
        Ok(Self::new(
            config,
            registry,
            summarizer,
            Arc::new(GitAdapterFactory),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn lock(&self, name_or_id: &str) -> Result<Locked> {
        let repository = self.registry.read().await.get(name_or_id)?.clone();
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(repository.id.clone()).or_default().clone()
        };

        let mut guard = slot.lock_owned().await;
        let repo = match guard.as_ref() {
            Some(repo) => repo.clone(),
            None => {
                let repo = self.factory.open(&repository, &self.config).await?;
                debug!(repo = %repository.name, backend = %repo.describe(), "adapter opened");
                *guard = Some(repo.clone());
                repo
            }
        };
        Ok(Locked {
            repository,
            repo,
            _guard: guard,
        })
    }

    fn ingestor<'a>(&'a self, locked: &'a Locked) -> Ingestor<'a> {
        Ingestor {
            repo: locked.repo.as_ref(),
            repository: &locked.repository,
            config: &self.config,
            summarizer: self.summarizer.as_ref(),
        }
    }

    pub async fn list_repositories(&self) -> Vec<RepositoryConfig> {
        self.registry.read().await.list().to_vec()
    }

    pub async fn get_repository_details(&self, name_or_id: &str) -> Result<RepositoryConfig> {
        Ok(self.registry.read().await.get(name_or_id)?.clone())
    }

    pub async fn register_repository(&self, new: NewRepository) -> Result<RepositoryConfig> {
        let name = new.name.clone();
        let repository = self
            .registry
            .write()
            .await
            .register(new, &self.config)
            .with_context(|| format!("register repository '{}'", name))?;
        Ok(repository)
    }

    pub async fn ingest_content(&self, repository: &str, input: IngestInput) -> Result<IngestResult> {
        let locked = self.lock(repository).await?;
        self.ingestor(&locked).ingest(input).await
    }

    /// Read-only access relative to the repository root.
    pub async fn browse(&self, repository: &str, op: BrowseOp, path: &str) -> Result<BrowseResult> {
        let path = path::guard(path)?;
        let locked = self.lock(repository).await?;
        let sync = sync_for_read(locked.repo.as_ref()).await;

        let mut result = BrowseResult {
            path: path.clone(),
            entries: None,
            content: None,
            warning: sync.warning,
        };
        match op {
            BrowseOp::ListDirectory => {
                result.entries = Some(
                    locked
                        .repo
                        .list_files(&path)
                        .await
                        .with_context(|| format!("list directory '{}'", path))?,
                );
            }
            BrowseOp::ReadFile => {
                result.content = Some(
                    locked
                        .repo
                        .read_file(&path)
                        .await
                        .with_context(|| format!("read file '{}'", path))?,
                );
            }
        }
        Ok(result)
    }

    /// Answer a question from the generated pages, falling back to the raw
    /// artifacts when no pages exist yet.
    pub async fn search_knowledge_base(&self, repository: &str, query: &str) -> Result<SearchResult> {
        let locked = self.lock(repository).await?;
        let sync = sync_for_read(locked.repo.as_ref()).await;
        let repo = locked.repo.as_ref();

        let mut documents = Vec::new();
        for dir in [&self.config.ingest.pages_dir, &self.config.ingest.raw_dir] {
            let root = path::guard(&locked.repository.kb_path(dir.trim_matches('/')))?;
            for file in walk_files(repo, &root).await? {
                let content = repo.read_file(&file).await?;
                let name = path::file_name(&file);
                let title = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                documents.push(SourceDocument {
                    path: file.clone(),
                    title: title.to_string(),
                    content,
                });
            }
            if !documents.is_empty() {
                break;
            }
        }

        if documents.is_empty() {
            return Ok(SearchResult {
                answer: "The knowledge base is empty.".to_string(),
                sources: Vec::new(),
                warning: sync.warning,
            });
        }

        let answer = answer_with_timeout(
            self.summarizer.as_ref(),
            query,
            &documents,
            self.config.summarizer.timeout_secs,
        )
        .await
        .with_context(|| format!("search '{}'", locked.repository.name))?;
        Ok(SearchResult {
            answer: answer.answer,
            sources: answer.sources,
            warning: sync.warning,
        })
    }

    pub async fn list_history(&self, repository: &str, query: &HistoryQuery) -> Result<HistoryResult> {
        let locked = self.lock(repository).await?;
        let sync = sync_for_read(locked.repo.as_ref()).await;
        let entries = TimelineLedger::new(locked.repo.as_ref()).read_all().await?;
        Ok(HistoryResult {
            changes: list_changes(&entries, query, Utc::now()),
            warning: sync.warning,
        })
    }

    pub async fn undo_changes(&self, repository: &str, request: &UndoRequest) -> Result<RevertResult> {
        let locked = self.lock(repository).await?;
        RevertEngine::new(self.ingestor(&locked)).undo(request).await
    }

    /// The plan an undo request would execute.
    pub async fn preview_undo(&self, repository: &str, request: &UndoRequest) -> Result<RevertPlan> {
        let locked = self.lock(repository).await?;
        sync_for_read(locked.repo.as_ref()).await;
        RevertEngine::new(self.ingestor(&locked)).preview(request).await
    }

    pub async fn reconcile(&self, repository: &str, depth: usize) -> Result<ReconcileReport> {
        let locked = self.lock(repository).await?;
        sync_for_read(locked.repo.as_ref()).await;
        Ok(TimelineLedger::new(locked.repo.as_ref())
            .reconcile(depth)
            .await?)
    }
}

/// Find the domain error behind an application error, if there is one.
pub fn domain_error(err: &anyhow::Error) -> Option<&KbError> {
    err.chain().find_map(|e| e.downcast_ref::<KbError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::ExtractiveSummarizer;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> KnowledgeService {
        let config = Config::with_state_dir(dir.path());
        let registry = RepositoryRegistry::load(config.storage.registry_file()).unwrap();
        KnowledgeService::new(
            config,
            registry,
            Arc::new(ExtractiveSummarizer::new(3)),
            Arc::new(MemoryAdapterFactory),
        )
    }

    fn local(name: &str) -> NewRepository {
        NewRepository {
            name: name.into(),
            knowledge_base_root: String::new(),
            backend: RepositoryBackend::Local {
                path: "/unused".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_adapter_is_cached_per_repository() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.register_repository(local("a")).await.unwrap();

        svc.ingest_content(
            "a",
            IngestInput::Text {
                title: "Note".into(),
                content: "Kept between calls.".into(),
            },
        )
        .await
        .unwrap();
        let read = svc
            .browse("a", BrowseOp::ReadFile, "raw/note.md")
            .await
            .unwrap();
        assert_eq!(read.content.as_deref(), Some("Kept between calls."));
    }

    #[tokio::test]
    async fn test_browse_rejects_reserved_paths() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.register_repository(local("a")).await.unwrap();

        for op in [BrowseOp::ReadFile, BrowseOp::ListDirectory] {
            let err = svc.browse("a", op, ".git/config").await.unwrap_err();
            assert!(matches!(
                domain_error(&err),
                Some(KbError::PathProhibited { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc
            .list_history("nope", &HistoryQuery::default())
            .await
            .unwrap_err();
        assert_eq!(domain_error(&err).map(KbError::code), Some("not_found"));
    }

    #[test]
    fn test_browse_op_parsing() {
        assert_eq!(
            "read_file".parse::<BrowseOp>().unwrap(),
            BrowseOp::ReadFile
        );
        assert!("delete".parse::<BrowseOp>().is_err());
    }
}
