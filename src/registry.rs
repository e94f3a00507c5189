//! Repository registry.
//!
//! Registered repositories are persisted as a JSON document at
//! `<storage.state_dir>/repositories.json`:
//!
//! ```json
//! {
//!   "repositories": [
//!     { "id": "…", "name": "handbook", "knowledgeBaseRoot": "kb",
//!       "type": "remote", "owner": "acme", "repoName": "handbook",
//!       "branch": "main", "credentialAlias": "acme-bot" }
//!   ]
//! }
//! ```
//!
//! Only the credential alias is stored. The secret is resolved from the
//! environment each time a remote repository is opened.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use kb_ledger_core::models::{RepositoryBackend, RepositoryConfig};
use kb_ledger_core::path;
use kb_ledger_core::{KbError, Result};

use crate::config::Config;

/// Registration input: a repository config without its generated id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRepository {
    pub name: String,
    #[serde(default)]
    pub knowledge_base_root: String,
    #[serde(flatten)]
    pub backend: RepositoryBackend,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    repositories: Vec<RepositoryConfig>,
}

pub struct RepositoryRegistry {
    file: PathBuf,
    repositories: Vec<RepositoryConfig>,
}

impl RepositoryRegistry {
    /// Load the registry file, or start empty if it does not exist yet.
    pub fn load(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let repositories = match std::fs::read_to_string(&file) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str::<RegistryDocument>(&raw)?.repositories,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { file, repositories })
    }

    /// Registry with no backing file changes until the first register.
    pub fn in_memory(file: impl Into<PathBuf>, repositories: Vec<RepositoryConfig>) -> Self {
        Self {
            file: file.into(),
            repositories,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn list(&self) -> &[RepositoryConfig] {
        &self.repositories
    }

    /// Look up by id first, then by name.
    pub fn get(&self, name_or_id: &str) -> Result<&RepositoryConfig> {
        self.repositories
            .iter()
            .find(|r| r.id == name_or_id)
            .or_else(|| self.repositories.iter().find(|r| r.name == name_or_id))
            .ok_or_else(|| KbError::not_found("repository", name_or_id))
    }

    /// Validate, assign an id and persist.
    pub fn register(&mut self, new: NewRepository, config: &Config) -> Result<RepositoryConfig> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(KbError::Configuration(
                "repository name must not be empty".to_string(),
            ));
        }
        if self.repositories.iter().any(|r| r.name == name) {
            return Err(KbError::Configuration(format!(
                "repository name '{}' is already in use",
                name
            )));
        }
        let kb_root = path::guard(&new.knowledge_base_root)?;

        match &new.backend {
            RepositoryBackend::Local { path } => {
                if path.as_os_str().is_empty() {
                    return Err(KbError::Configuration(format!(
                        "local repository '{}' needs a path",
                        name
                    )));
                }
            }
            RepositoryBackend::Remote {
                owner,
                repo_name,
                branch,
                credential_alias,
            } => {
                if owner.trim().is_empty() || repo_name.trim().is_empty() || branch.trim().is_empty()
                {
                    return Err(KbError::Configuration(format!(
                        "remote repository '{}' needs owner, repoName and branch",
                        name
                    )));
                }
                resolve_credential(config, credential_alias)?;
            }
        }

        let repository = RepositoryConfig::new(name, kb_root, new.backend);
        self.repositories.push(repository.clone());
        if let Err(e) = self.save() {
            self.repositories.pop();
            return Err(e);
        }
        info!(id = %repository.id, name = %repository.name, kind = repository.kind(), "repository registered");
        Ok(repository)
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let doc = RegistryDocument {
            repositories: self.repositories.clone(),
        };
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}

/// Resolve a credential alias to its secret through the environment.
pub fn resolve_credential(config: &Config, alias: &str) -> Result<String> {
    let var = config.credential_env_var(alias);
    match std::env::var(&var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(KbError::Configuration(format!(
            "credential alias '{}' cannot be resolved: environment variable {} is not set",
            alias, var
        ))),
    }
}
