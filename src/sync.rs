//! Sync-before-access policy.
//!
//! Reads tolerate stale data: a failed sync becomes a warning and the read
//! proceeds on local state. Writes must start from the latest remote state,
//! so a failed sync aborts them.

use serde::Serialize;
use tracing::warn;

use kb_ledger_core::repo::{Repository, SyncReport};
use kb_ledger_core::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadSync {
    pub pulled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Sync before a read. Never fails.
pub async fn sync_for_read(repo: &dyn Repository) -> ReadSync {
    match repo.sync().await {
        Ok(report) => ReadSync {
            pulled: report.pulled,
            warning: None,
        },
        Err(e) => {
            warn!(repo = %repo.describe(), error = %e, "sync failed; using local state");
            ReadSync {
                pulled: false,
                warning: Some(format!("sync failed, results may be stale: {}", e)),
            }
        }
    }
}

/// Sync before a mutation. Sync errors propagate.
pub async fn sync_for_write(repo: &dyn Repository) -> Result<SyncReport> {
    repo.sync().await.inspect_err(|e| {
        warn!(repo = %repo.describe(), error = %e, "sync failed; refusing to write");
    })
}
