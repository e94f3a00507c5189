//! Core data model: repository configuration, timeline entries, and the
//! derived change / revert views computed from them.
//!
//! Everything here serializes with camelCase field names so the persisted
//! ledger (`.kb/timeline.json`) and the tool payloads share one shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Directory holding kb-ledger's own control files, relative to the
/// repository root.
pub const METADATA_DIR: &str = ".kb";

/// Ledger file name inside [`METADATA_DIR`].
pub const LEDGER_FILE: &str = "timeline.json";

/// Reserved `meta` keys written by the ingestion and revert pipelines.
pub mod meta {
    pub const STAGE: &str = "stage";
    pub const REVERT_OF: &str = "revertOf";
    pub const REVERTED_CHANGES: &str = "revertedChanges";
    pub const REVERT_TYPE: &str = "revertType";
    pub const CREATED_PAGES: &str = "createdPages";
    pub const ERROR: &str = "error";
    pub const FAILED_STEP: &str = "failedStep";
    pub const REGENERATED_FROM: &str = "regeneratedFrom";
    pub const TITLE: &str = "title";
    pub const INPUT_KIND: &str = "inputKind";

    pub const STAGE_RAW: &str = "raw";
    pub const STAGE_GENERATION: &str = "generation";
    pub const STAGE_REVERT: &str = "revert";
    pub const STAGE_REGENERATION: &str = "regeneration";
}

// ═══════════════════════════════════════════════════════════════════════
// Repository configuration
// ═══════════════════════════════════════════════════════════════════════

/// A registered repository.
///
/// The backend is a tagged union (`"type": "local" | "remote"`) flattened
/// next to the fields every repository shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Stable identifier, generated at registration and never changed.
    pub id: String,
    /// Unique, human-chosen name.
    pub name: String,
    /// Path prefix scoping all knowledge-base operations. Empty means the
    /// repository root.
    #[serde(default)]
    pub knowledge_base_root: String,
    #[serde(flatten)]
    pub backend: RepositoryBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepositoryBackend {
    Local {
        path: PathBuf,
    },
    Remote {
        owner: String,
        #[serde(rename = "repoName")]
        repo_name: String,
        branch: String,
        /// Indirection to a secret; the secret itself is never stored.
        #[serde(rename = "credentialAlias")]
        credential_alias: String,
    },
}

impl RepositoryConfig {
    /// Build a config with a freshly generated id.
    pub fn new(
        name: impl Into<String>,
        knowledge_base_root: impl Into<String>,
        backend: RepositoryBackend,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            knowledge_base_root: knowledge_base_root.into(),
            backend,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            RepositoryBackend::Local { .. } => "local",
            RepositoryBackend::Remote { .. } => "remote",
        }
    }

    /// Join a path onto the knowledge-base root.
    pub fn kb_path(&self, relative: &str) -> String {
        let root = self.knowledge_base_root.trim_matches('/');
        let relative = relative.trim_start_matches('/');
        if root.is_empty() || root == "." {
            relative.to_string()
        } else {
            format!("{}/{}", root, relative)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Timeline entries
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Update,
    Delete,
    Regen,
    Error,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Add => "add",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Regen => "regen",
            Operation::Error => "error",
        };
        f.write_str(s)
    }
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub operation: Operation,
    #[serde(default)]
    pub source_path: Option<String>,
    /// Revision containing this event's effects. Empty only for `error`.
    #[serde(default)]
    pub commit: String,
    #[serde(default, rename = "affectedKnowledgeBasePaths")]
    pub affected_kb_paths: Vec<String>,
    #[serde(default)]
    pub bulk: bool,
    /// Correlation key shared by every entry of one ingest or revert request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl TimelineEntry {
    pub fn new(actor: Actor, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor,
            operation,
            source_path: None,
            commit: String::new(),
            affected_kb_paths: Vec::new(),
            bulk: false,
            request_id: None,
            meta: Map::new(),
        }
    }

    pub fn with_source(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }

    pub fn with_kb_paths(mut self, paths: Vec<String>) -> Self {
        self.affected_kb_paths = paths;
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_bulk(mut self, bulk: bool) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn stage(&self) -> Option<&str> {
        self.meta.get(meta::STAGE).and_then(|v| v.as_str())
    }

    /// Entry ids undone by this entry, if it records a revert.
    pub fn revert_targets(&self) -> Vec<&str> {
        self.meta
            .get(meta::REVERT_OF)
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|id| id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_revert_record(&self) -> bool {
        self.meta.contains_key(meta::REVERT_OF)
    }
}

/// On-disk shape of the ledger file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub entries: Vec<TimelineEntry>,
}

// ═══════════════════════════════════════════════════════════════════════
// Changes (derived)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    FileUpload,
    KnowledgeBaseGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Added,
    Updated,
    Removed,
}

/// Which change types a history filter or revert request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    FileUpload,
    KnowledgeBaseGeneration,
    #[default]
    Both,
}

impl ChangeScope {
    pub fn includes(self, change_type: ChangeType) -> bool {
        match self {
            ChangeScope::Both => true,
            ChangeScope::FileUpload => change_type == ChangeType::FileUpload,
            ChangeScope::KnowledgeBaseGeneration => {
                change_type == ChangeType::KnowledgeBaseGeneration
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeScope::FileUpload => "file_upload",
            ChangeScope::KnowledgeBaseGeneration => "knowledge_base_generation",
            ChangeScope::Both => "both",
        }
    }
}

impl FromStr for ChangeScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_upload" => Ok(ChangeScope::FileUpload),
            "knowledge_base_generation" => Ok(ChangeScope::KnowledgeBaseGeneration),
            "both" => Ok(ChangeScope::Both),
            other => Err(format!(
                "unknown change type '{}': expected file_upload, knowledge_base_generation or both",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDetails {
    /// Who originated the change.
    pub user: Actor,
    pub bulk: bool,
    pub latest_commit: String,
    pub entry_count: usize,
}

/// A human-meaningful grouping of ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Id of the oldest entry in the group.
    pub id: String,
    pub change_type: ChangeType,
    pub operation: ChangeOperation,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub relative_time: String,
    pub source_path: Option<String>,
    pub files_affected: Vec<String>,
    pub entry_ids: Vec<String>,
    pub commits: Vec<String>,
    pub request_id: Option<String>,
    pub reverted: bool,
    pub details: ChangeDetails,
    /// Ledger index of the newest entry in the group.
    #[serde(skip)]
    pub position: usize,
}

// ═══════════════════════════════════════════════════════════════════════
// Revert plan / result
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertKind {
    RemoveSource,
    RemoveKbOnly,
    RemoveBoth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertStep {
    pub target_entry_id: String,
    pub change_id: String,
    pub revert_kind: RevertKind,
    pub commit: String,
}

/// Fully computed before any repository mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertPlan {
    pub scope: ChangeScope,
    /// Most recent first.
    pub steps: Vec<RevertStep>,
    pub changes: Vec<Change>,
    /// Change ids that resolved but were already reverted or out of scope.
    pub skipped: Vec<String>,
}

impl RevertPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct commits to invert, most recent first.
    pub fn commits(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for step in &self.steps {
            if !out.contains(&step.commit) {
                out.push(step.commit.clone());
            }
        }
        out
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.target_entry_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertResult {
    pub success: bool,
    pub message: String,
    pub revert_commit_ids: Vec<String>,
    pub changes_reverted: Vec<Change>,
    pub regeneration_triggered: bool,
    #[serde(default)]
    pub regenerated_paths: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_config_tagged_shape() {
        let cfg = RepositoryConfig {
            id: "r1".into(),
            name: "docs".into(),
            knowledge_base_root: "kb".into(),
            backend: RepositoryBackend::Remote {
                owner: "acme".into(),
                repo_name: "handbook".into(),
                branch: "main".into(),
                credential_alias: "acme-bot".into(),
            },
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["type"], "remote");
        assert_eq!(json["repoName"], "handbook");
        assert_eq!(json["knowledgeBaseRoot"], "kb");

        let back: RepositoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_local_config_defaults_kb_root() {
        let cfg: RepositoryConfig = serde_json::from_str(
            r#"{"id":"x","name":"notes","type":"local","path":"/tmp/notes"}"#,
        )
        .unwrap();
        assert_eq!(cfg.knowledge_base_root, "");
        assert_eq!(cfg.kind(), "local");
        assert_eq!(cfg.kb_path("raw/a.md"), "raw/a.md");
    }

    #[test]
    fn test_kb_path_joins_prefix() {
        let cfg = RepositoryConfig::new(
            "n",
            "/knowledge/",
            RepositoryBackend::Local {
                path: PathBuf::from("/tmp"),
            },
        );
        assert_eq!(cfg.kb_path("wiki/a.md"), "knowledge/wiki/a.md");
    }

    #[test]
    fn test_entry_uses_spec_field_names() {
        let entry = TimelineEntry::new(Actor::User, Operation::Update)
            .with_source("raw/a.md")
            .with_commit("abc")
            .with_kb_paths(vec!["wiki/a.md".into()]);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["operation"], "update");
        assert_eq!(json["sourcePath"], "raw/a.md");
        assert_eq!(json["affectedKnowledgeBasePaths"][0], "wiki/a.md");
        assert!(json.get("requestId").is_none());
    }

    #[test]
    fn test_revert_targets_read_from_meta() {
        let entry = TimelineEntry::new(Actor::User, Operation::Delete)
            .with_meta(meta::REVERT_OF, serde_json::json!(["e1", "e2"]));
        assert!(entry.is_revert_record());
        assert_eq!(entry.revert_targets(), vec!["e1", "e2"]);
    }

    #[test]
    fn test_plan_commits_are_distinct_in_order() {
        let step = |entry: &str, commit: &str| RevertStep {
            target_entry_id: entry.into(),
            change_id: entry.into(),
            revert_kind: RevertKind::RemoveKbOnly,
            commit: commit.into(),
        };
        let plan = RevertPlan {
            scope: ChangeScope::Both,
            steps: vec![step("e3", "c3"), step("e2", "c2"), step("e1", "c2")],
            changes: vec![],
            skipped: vec![],
        };
        assert_eq!(plan.commits(), vec!["c3", "c2"]);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("both".parse::<ChangeScope>().unwrap(), ChangeScope::Both);
        assert!("everything".parse::<ChangeScope>().is_err());
        assert!(ChangeScope::FileUpload.includes(ChangeType::FileUpload));
        assert!(!ChangeScope::FileUpload.includes(ChangeType::KnowledgeBaseGeneration));
    }
}
