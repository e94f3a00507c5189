//! Error taxonomy shared by every kb-ledger component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("{what} not found: {target}")]
    NotFound { what: &'static str, target: String },

    #[error("access to reserved path is prohibited: {path}")]
    PathProhibited { path: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("sync conflict: {message}")]
    SyncConflict { message: String },

    #[error("sync failed: {message}")]
    SyncFailure { message: String },

    #[error("exactly one of filename, changeId or lastNChanges must be supplied (got {supplied})")]
    AmbiguousRevertTarget { supplied: usize },

    #[error("revert conflict on: {}", paths.join(", "))]
    RevertConflict { paths: Vec<String> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid timeline entry: {0}")]
    InvalidEntry(String),

    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("summarizer error: {0}")]
    Summarizer(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = KbError> = std::result::Result<T, E>;

impl KbError {
    pub fn not_found(what: &'static str, target: impl Into<String>) -> Self {
        KbError::NotFound {
            what,
            target: target.into(),
        }
    }

    /// Stable machine-readable code used by the transports.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::NotFound { .. } => "not_found",
            KbError::PathProhibited { .. } => "path_prohibited",
            KbError::InvalidPath { .. } => "invalid_path",
            KbError::SyncConflict { .. } => "sync_conflict",
            KbError::SyncFailure { .. } => "sync_failure",
            KbError::AmbiguousRevertTarget { .. } => "ambiguous_revert_target",
            KbError::RevertConflict { .. } => "revert_conflict",
            KbError::Configuration(_) => "configuration_error",
            KbError::InvalidEntry(_) => "invalid_entry",
            KbError::Git { .. } => "git_error",
            KbError::Summarizer(_) => "summarizer_error",
            KbError::Timeout { .. } => "timeout",
            KbError::Io(_) => "io_error",
            KbError::Serialization(_) => "serialization_error",
        }
    }

    /// Sync errors are soft for reads; callers use this to decide.
    pub fn is_sync_error(&self) -> bool {
        matches!(
            self,
            KbError::SyncConflict { .. } | KbError::SyncFailure { .. }
        )
    }
}
