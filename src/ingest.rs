//! Content ingestion orchestration.
//!
//! Turns inline text, an uploaded file, or a fetched URL into a raw
//! artifact, then asks the summarizer for knowledge-base pages:
//!
//! ```text
//! sync → write raw → commit → append(add|update)
//!      → summarizer.generate → write pages → commit → append(update)
//! ```
//!
//! Both ledger entries share one `requestId`. If generation fails the raw
//! step stays committed and recorded, an `error` entry is appended, and the
//! result says so.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use kb_ledger_core::models::{meta, Actor, Operation, RepositoryConfig, TimelineEntry};
use kb_ledger_core::path;
use kb_ledger_core::repo::{walk_files, Repository, CONTENT_COMMIT_PREFIX};
use kb_ledger_core::KbError;

use crate::config::Config;
use crate::extract::{self, DocumentKind};
use crate::ledger::TimelineLedger;
use crate::summarizer::{generate_with_timeout, GenerationRequest, SourceDocument, Summarizer};
use crate::sync::sync_for_write;

/// One ingestion request, tagged by `inputKind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "inputKind",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum IngestInput {
    Text {
        title: String,
        content: String,
    },
    File {
        filename: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        content_base64: Option<String>,
        #[serde(default)]
        content_type: Option<String>,
    },
    Url {
        url: String,
    },
}

impl IngestInput {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestInput::Text { .. } => "text",
            IngestInput::File { .. } => "file",
            IngestInput::Url { .. } => "url",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub raw_path: String,
    pub knowledge_base_updated: bool,
    pub knowledge_base_paths: Vec<String>,
    pub request_id: String,
    pub raw_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
}

/// Pages written for one source and the commit holding them.
#[derive(Debug, Clone)]
pub struct PagesWritten {
    pub paths: Vec<String>,
    /// Subset of `paths` that did not exist before.
    pub created: Vec<String>,
    pub commit: String,
}

/// Raw artifact ready to be written.
struct Prepared {
    file_name: String,
    title: String,
    content: String,
}

/// Everything an ingestion (or regeneration) needs for one repository.
pub struct Ingestor<'a> {
    pub repo: &'a dyn Repository,
    pub repository: &'a RepositoryConfig,
    pub config: &'a Config,
    pub summarizer: &'a dyn Summarizer,
}

impl<'a> Ingestor<'a> {
    pub async fn ingest(&self, input: IngestInput) -> Result<IngestResult> {
        let kind = input.kind();
        sync_for_write(self.repo)
            .await
            .with_context(|| format!("ingest into '{}'", self.repository.name))?;

        let prepared = self.prepare(input).await?;
        let raw_path = path::guard(&self.repository.kb_path(&format!(
            "{}/{}",
            self.config.ingest.raw_dir.trim_matches('/'),
            prepared.file_name
        )))?;

        let ledger = TimelineLedger::new(self.repo);
        let request_id = Uuid::new_v4().to_string();

        let existed = self.repo.file_exists(&raw_path).await?;
        let operation = if existed {
            Operation::Update
        } else {
            Operation::Add
        };
        self.repo.write_file(&raw_path, &prepared.content).await?;
        let raw_commit = self
            .repo
            .commit(&format!("{}{} {}", CONTENT_COMMIT_PREFIX, operation, raw_path))
            .await
            .with_context(|| format!("commit raw artifact {}", raw_path))?;
        ledger
            .append(
                TimelineEntry::new(Actor::User, operation)
                    .with_source(&raw_path)
                    .with_commit(&raw_commit)
                    .with_request(&request_id)
                    .with_meta(meta::STAGE, meta::STAGE_RAW)
                    .with_meta(meta::TITLE, prepared.title.as_str())
                    .with_meta(meta::INPUT_KIND, kind),
            )
            .await?;

        let source = SourceDocument {
            path: raw_path.clone(),
            title: prepared.title,
            content: prepared.content,
        };

        match self.write_pages(source).await {
            Ok(pages) => {
                ledger
                    .append(
                        TimelineEntry::new(Actor::System, Operation::Update)
                            .with_source(&raw_path)
                            .with_commit(&pages.commit)
                            .with_kb_paths(pages.paths.clone())
                            .with_request(&request_id)
                            .with_bulk(pages.paths.len() > self.config.ingest.bulk_threshold)
                            .with_meta(meta::STAGE, meta::STAGE_GENERATION)
                            .with_meta(meta::CREATED_PAGES, pages.created.clone()),
                    )
                    .await?;
                info!(
                    repo = %self.repository.name,
                    raw = %raw_path,
                    pages = pages.paths.len(),
                    "ingested"
                );
                Ok(IngestResult {
                    raw_path,
                    knowledge_base_updated: true,
                    knowledge_base_paths: pages.paths,
                    request_id,
                    raw_commit,
                    generation_commit: Some(pages.commit),
                    generation_error: None,
                })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(repo = %self.repository.name, raw = %raw_path, error = %message, "page generation failed");
                ledger
                    .append(
                        TimelineEntry::new(Actor::System, Operation::Error)
                            .with_source(&raw_path)
                            .with_request(&request_id)
                            .with_meta(meta::STAGE, meta::STAGE_GENERATION)
                            .with_meta(meta::FAILED_STEP, "generation")
                            .with_meta(meta::ERROR, message.as_str()),
                    )
                    .await?;
                Ok(IngestResult {
                    raw_path,
                    knowledge_base_updated: false,
                    knowledge_base_paths: Vec::new(),
                    request_id,
                    raw_commit,
                    generation_commit: None,
                    generation_error: Some(message),
                })
            }
        }
    }

    /// Generate pages for `source`, write them under the pages directory
    /// and commit. Nothing is written unless every page path is valid, and
    /// a failed write or commit puts the touched pages back.
    pub async fn write_pages(&self, source: SourceDocument) -> Result<PagesWritten> {
        let pages_root = path::guard(
            &self
                .repository
                .kb_path(self.config.ingest.pages_dir.trim_matches('/')),
        )?;
        let existing_pages: Vec<String> = walk_files(self.repo, &pages_root)
            .await?
            .into_iter()
            .filter_map(|p| {
                p.strip_prefix(&format!("{}/", pages_root))
                    .map(str::to_string)
            })
            .collect();

        let request = GenerationRequest {
            sources: vec![source.clone()],
            existing_pages,
        };
        let pages = generate_with_timeout(
            self.summarizer,
            &request,
            self.config.summarizer.timeout_secs,
        )
        .await?;
        if pages.is_empty() {
            bail!("Summarizer produced no pages for {}", source.path);
        }

        let mut targets: Vec<(String, &str)> = Vec::with_capacity(pages.len());
        for page in &pages {
            let rel = path::guard(&page.path)
                .with_context(|| format!("summarizer returned invalid page path '{}'", page.path))?;
            if rel.is_empty() {
                bail!("Summarizer returned an empty page path");
            }
            let full = path::guard(&format!("{}/{}", pages_root, rel))?;
            if !targets.iter().any(|(p, _)| p == &full) {
                targets.push((full, page.content.as_str()));
            }
        }

        let mut previous: Vec<(String, Option<String>)> = Vec::with_capacity(targets.len());
        match self.commit_pages(&targets, &source.path, &mut previous).await {
            Ok(written) => Ok(written),
            Err(e) => {
                self.restore_pages(&previous).await;
                Err(e)
            }
        }
    }

    /// Write every target and commit. `previous` collects each path's prior
    /// content before it is overwritten.
    async fn commit_pages(
        &self,
        targets: &[(String, &str)],
        source_path: &str,
        previous: &mut Vec<(String, Option<String>)>,
    ) -> Result<PagesWritten> {
        let mut paths = Vec::with_capacity(targets.len());
        let mut created = Vec::new();
        for (full, content) in targets {
            let prior = match self.repo.read_file(full).await {
                Ok(prior) => Some(prior),
                Err(KbError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            if prior.is_none() {
                created.push(full.clone());
            }
            previous.push((full.clone(), prior));
            self.repo
                .write_file(full, content)
                .await
                .with_context(|| format!("write page '{}'", full))?;
            paths.push(full.clone());
        }

        let commit = self
            .repo
            .commit(&format!(
                "{}generate {} page(s) from {}",
                CONTENT_COMMIT_PREFIX,
                paths.len(),
                source_path
            ))
            .await?;

        Ok(PagesWritten {
            paths,
            created,
            commit,
        })
    }

    /// Put pages back the way they were before a failed generation.
    async fn restore_pages(&self, previous: &[(String, Option<String>)]) {
        for (path, prior) in previous.iter().rev() {
            let restored = match prior {
                Some(content) => self.repo.write_file(path, content).await,
                None => match self.repo.delete_file(path).await {
                    Err(KbError::NotFound { .. }) => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                warn!(path = %path, error = %e, "failed to restore page after generation error");
            }
        }
    }

    async fn prepare(&self, input: IngestInput) -> Result<Prepared> {
        match input {
            IngestInput::Text { title, content } => {
                let title = title.trim().to_string();
                if title.is_empty() {
                    bail!("Text input requires a non-empty title");
                }
                Ok(Prepared {
                    file_name: format!("{}.md", slugify(&title)),
                    title,
                    content,
                })
            }
            IngestInput::File {
                filename,
                content,
                content_base64,
                content_type,
            } => {
                let normalized = path::normalize(&filename)?;
                let name = path::file_name(&normalized).to_string();
                if name.is_empty() {
                    bail!("File input requires a filename");
                }
                let bytes = match (content, content_base64) {
                    (Some(text), None) => text.into_bytes(),
                    (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                        .decode(encoded.trim())
                        .with_context(|| format!("contentBase64 for '{}' is not valid base64", name))?,
                    _ => bail!("File input requires exactly one of content or contentBase64"),
                };

                let kind = match extract::detect_kind(&name, content_type.as_deref()) {
                    Some(kind) => kind,
                    None if std::str::from_utf8(&bytes).is_ok() => DocumentKind::Text,
                    None => bail!("Unsupported file type for '{}'", name),
                };
                let text = extract::extract_text(&bytes, kind)
                    .with_context(|| format!("extract text from '{}'", name))?;

                let stem = name
                    .rsplit_once('.')
                    .map(|(s, _)| s.to_string())
                    .unwrap_or_else(|| name.clone());
                let file_name = if kind.is_converted() {
                    format!("{}.md", slugify(&stem))
                } else {
                    name
                };
                Ok(Prepared {
                    file_name,
                    title: stem,
                    content: text,
                })
            }
            IngestInput::Url { url } => self.fetch_url(&url).await,
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<Prepared> {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("Only http and https URLs can be ingested, got '{}'", url);
        }

        let limit = self.config.ingest.max_fetch_bytes;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.ingest.fetch_timeout_secs))
            .build()?;
        let mut response = client
            .get(parsed.clone())
            .send()
            .await
            .with_context(|| format!("fetch {}", url))?;
        if !response.status().is_success() {
            bail!("Fetching {} returned HTTP {}", url, response.status());
        }
        if response.content_length().is_some_and(|len| len as usize > limit) {
            bail!("{} is larger than the {} byte fetch limit", url, limit);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                bail!("{} is larger than the {} byte fetch limit", url, limit);
            }
            body.extend_from_slice(&chunk);
        }

        let kind = extract::detect_kind(parsed.path(), content_type.as_deref())
            .unwrap_or(DocumentKind::Html);
        let text = extract::extract_text(&body, kind)
            .with_context(|| format!("extract text from {}", url))?;
        if text.trim().is_empty() {
            bail!("{} has no text content", url);
        }

        let host = parsed.host_str().unwrap_or("page");
        let slug = slugify(&format!("{}{}", host, parsed.path()));
        Ok(Prepared {
            file_name: format!("{}.md", slug),
            title: format!("{}{}", host, parsed.path().trim_end_matches('/')),
            content: format!("Source: {}\n\n{}", url, text),
        })
    }
}

/// Lowercase ASCII slug: alphanumerics kept, runs of anything else become `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(80).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
