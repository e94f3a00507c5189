//! TOML configuration.
//!
//! ```toml
//! [storage]
//! state_dir = "./data"
//!
//! [ingest]
//! raw_dir = "raw"
//! pages_dir = "wiki"
//!
//! [summarizer]
//! provider = "extractive"
//!
//! [git]
//! author_name = "kb-ledger"
//!
//! [credentials]
//! acme-bot = "ACME_GITHUB_TOKEN"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```
//!
//! Only `[storage]` is required; every other section has defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub git: GitConfig,
    /// Credential alias → environment variable holding the secret.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Holds `repositories.json` and, unless `cache_dir` is set, remote clones.
    pub state_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn registry_file(&self) -> PathBuf {
        self.state_dir.join("repositories.json")
    }

    pub fn clone_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("clones"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_raw_dir")]
    pub raw_dir: String,
    #[serde(default = "default_pages_dir")]
    pub pages_dir: String,
    /// Events touching more files than this are flagged `bulk`.
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            pages_dir: default_pages_dir(),
            bulk_threshold: default_bulk_threshold(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_fetch_bytes: default_max_fetch_bytes(),
        }
    }
}

fn default_raw_dir() -> String {
    "raw".to_string()
}
fn default_pages_dir() -> String {
    "wiki".to_string()
}
fn default_bulk_threshold() -> usize {
    10
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_fetch_bytes() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    /// `disabled`, `extractive` or `http`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: default_summarizer_timeout(),
            max_sentences: default_max_sentences(),
        }
    }
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "extractive".to_string()
}
fn default_summarizer_timeout() -> u64 {
    60
}
fn default_max_sentences() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    /// Remote repositories clone from `<remote_base_url>/<owner>/<repo>.git`.
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            remote_base_url: default_remote_base_url(),
        }
    }
}

fn default_author_name() -> String {
    "kb-ledger".to_string()
}
fn default_author_email() -> String {
    "kb-ledger@localhost".to_string()
}
fn default_remote_base_url() -> String {
    "https://github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    /// A default configuration rooted at `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                state_dir: state_dir.into(),
                cache_dir: None,
            },
            ingest: IngestConfig::default(),
            summarizer: SummarizerConfig::default(),
            git: GitConfig::default(),
            credentials: HashMap::new(),
            server: ServerConfig::default(),
        }
    }

    /// Environment variable consulted for a credential alias.
    ///
    /// Aliases listed under `[credentials]` map explicitly; anything else
    /// falls back to `KB_CREDENTIAL_<ALIAS>`.
    pub fn credential_env_var(&self, alias: &str) -> String {
        if let Some(var) = self.credentials.get(alias) {
            return var.clone();
        }
        let suffix: String = alias
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("KB_CREDENTIAL_{}", suffix)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.state_dir.as_os_str().is_empty() {
            bail!("storage.state_dir must not be empty");
        }

        for (key, dir) in [
            ("ingest.raw_dir", &self.ingest.raw_dir),
            ("ingest.pages_dir", &self.ingest.pages_dir),
        ] {
            let normalized = kb_ledger_core::path::guard(dir)
                .with_context(|| format!("{} is not a valid repository path", key))?;
            if normalized.is_empty() {
                bail!("{} must name a directory below the knowledge-base root", key);
            }
        }
        if self.ingest.raw_dir.trim_matches('/') == self.ingest.pages_dir.trim_matches('/') {
            bail!("ingest.raw_dir and ingest.pages_dir must differ");
        }
        if self.ingest.bulk_threshold == 0 {
            bail!("ingest.bulk_threshold must be > 0");
        }
        if self.ingest.fetch_timeout_secs == 0 {
            bail!("ingest.fetch_timeout_secs must be > 0");
        }
        if self.ingest.max_fetch_bytes == 0 {
            bail!("ingest.max_fetch_bytes must be > 0");
        }

        if self.summarizer.timeout_secs == 0 {
            bail!("summarizer.timeout_secs must be > 0");
        }
        match self.summarizer.provider.as_str() {
            "disabled" | "extractive" => {}
            "http" => {
                if self.summarizer.endpoint.is_none() {
                    bail!("summarizer.endpoint must be specified when provider is 'http'");
                }
            }
            other => bail!(
                "Unknown summarizer provider: '{}'. Must be disabled, extractive, or http.",
                other
            ),
        }

        if self.git.remote_base_url.trim().is_empty() {
            bail!("git.remote_base_url must not be empty");
        }
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }

        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[storage]\nstate_dir = \"/tmp/kb\"\n").unwrap();
        assert_eq!(config.ingest.raw_dir, "raw");
        assert_eq!(config.ingest.pages_dir, "wiki");
        assert_eq!(config.ingest.bulk_threshold, 10);
        assert_eq!(config.summarizer.provider, "extractive");
        assert_eq!(config.summarizer.timeout_secs, 60);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(
            config.storage.registry_file(),
            PathBuf::from("/tmp/kb/repositories.json")
        );
        assert_eq!(config.storage.clone_dir(), PathBuf::from("/tmp/kb/clones"));
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let err = parse_config(
            "[storage]\nstate_dir = \"/tmp/kb\"\n[summarizer]\nprovider = \"http\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config(
            "[storage]\nstate_dir = \"/tmp/kb\"\n[summarizer]\nprovider = \"oracle\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown summarizer provider"));
    }

    #[test]
    fn test_reserved_ingest_dirs_rejected() {
        let err = parse_config(
            "[storage]\nstate_dir = \"/tmp/kb\"\n[ingest]\nraw_dir = \".git/raw\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("ingest.raw_dir"));

        assert!(parse_config(
            "[storage]\nstate_dir = \"/tmp/kb\"\n[ingest]\nraw_dir = \"x\"\npages_dir = \"x\"\n",
        )
        .is_err());
    }

    #[test]
    fn test_credential_env_var_fallback() {
        let mut config = Config::with_state_dir("/tmp/kb");
        config
            .credentials
            .insert("acme".to_string(), "ACME_TOKEN".to_string());
        assert_eq!(config.credential_env_var("acme"), "ACME_TOKEN");
        assert_eq!(
            config.credential_env_var("my-bot.1"),
            "KB_CREDENTIAL_MY_BOT_1"
        );
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = parse_config(include_str!("../config/kb.toml")).unwrap();
        assert_eq!(config.summarizer.provider, "extractive");
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/kb.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kb.toml"));
    }
}
