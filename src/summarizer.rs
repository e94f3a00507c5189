//! Content summarizer: the external collaborator that authors knowledge-base
//! pages from raw artifacts and answers questions over those pages.
//!
//! Defines the [`Summarizer`] trait and three providers:
//! - **[`DisabledSummarizer`]**: always errors; ingestion still stores the raw artifact.
//! - **[`ExtractiveSummarizer`]**: deterministic and offline. One page per source
//!   made of its leading sentences; answers by term overlap.
//! - **[`HttpSummarizer`]**: delegates to a JSON service over HTTP.
//!
//! Calls go through [`generate_with_timeout`] and [`answer_with_timeout`],
//! which bound them with `summarizer.timeout_secs`. There are no automatic
//! retries; a failure is reported to the caller.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kb_ledger_core::KbError;

use crate::config::SummarizerConfig;
use crate::ingest::slugify;

/// A document handed to the summarizer: a raw artifact or an existing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub path: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub sources: Vec<SourceDocument>,
    /// Page names already present, relative to the pages directory.
    pub existing_pages: Vec<String>,
}

/// A generated page. `path` is relative to the pages directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbPage {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<String>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<KbPage>>;

    async fn answer(&self, question: &str, pages: &[SourceDocument]) -> Result<Answer>;
}

pub async fn generate_with_timeout(
    summarizer: &dyn Summarizer,
    request: &GenerationRequest,
    timeout_secs: u64,
) -> Result<Vec<KbPage>> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), summarizer.generate(request))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(KbError::Timeout {
            operation: format!("{} page generation", summarizer.name()),
            secs: timeout_secs,
        }
        .into()),
    }
}

pub async fn answer_with_timeout(
    summarizer: &dyn Summarizer,
    question: &str,
    pages: &[SourceDocument],
    timeout_secs: u64,
) -> Result<Answer> {
    match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        summarizer.answer(question, pages),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(KbError::Timeout {
            operation: format!("{} answer", summarizer.name()),
            secs: timeout_secs,
        }
        .into()),
    }
}

// ============ Disabled ============

pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<KbPage>> {
        bail!("Summarizer is disabled; set summarizer.provider to generate pages")
    }

    async fn answer(&self, _question: &str, _pages: &[SourceDocument]) -> Result<Answer> {
        bail!("Summarizer is disabled; set summarizer.provider to answer questions")
    }
}

// ============ Extractive ============

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with",
];

pub struct ExtractiveSummarizer {
    max_sentences: usize,
}

impl ExtractiveSummarizer {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
        }
    }

    fn render_page(&self, source: &SourceDocument) -> String {
        let body = strip_heading(&source.content, &source.title);
        let summary: Vec<String> = sentences(&body)
            .into_iter()
            .take(self.max_sentences)
            .collect();
        let summary = if summary.is_empty() {
            "(no text content)".to_string()
        } else {
            summary.join(" ")
        };

        let terms = key_terms(&body, 5);
        let mut page = format!(
            "# {}\n\nSource: `{}`\n\n## Summary\n\n{}\n",
            source.title, source.path, summary
        );
        if !terms.is_empty() {
            page.push_str("\n## Key terms\n\n");
            for term in terms {
                page.push_str(&format!("- {}\n", term));
            }
        }
        page
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<KbPage>> {
        Ok(request
            .sources
            .iter()
            .map(|source| {
                let stem = source
                    .path
                    .rsplit('/')
                    .next()
                    .and_then(|name| name.rsplit_once('.').map(|(s, _)| s).or(Some(name)))
                    .unwrap_or(source.title.as_str());
                KbPage {
                    path: format!("{}.md", slugify(stem)),
                    content: self.render_page(source),
                }
            })
            .collect())
    }

    async fn answer(&self, question: &str, pages: &[SourceDocument]) -> Result<Answer> {
        let terms: HashSet<String> = tokens(question).into_iter().collect();
        if terms.is_empty() {
            bail!("Question has no searchable terms");
        }

        let mut scored: Vec<(usize, &SourceDocument)> = pages
            .iter()
            .map(|p| {
                let score = tokens(&p.content)
                    .iter()
                    .filter(|t| terms.contains(*t))
                    .count();
                (score, p)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.path.cmp(&b.1.path)));
        scored.truncate(3);

        if scored.is_empty() {
            return Ok(Answer {
                answer: "No relevant information found in the knowledge base.".to_string(),
                sources: Vec::new(),
            });
        }

        let mut picked: Vec<String> = Vec::new();
        for (_, page) in &scored {
            for sentence in sentences(&page.content) {
                if picked.len() >= self.max_sentences {
                    break;
                }
                if tokens(&sentence).iter().any(|t| terms.contains(t)) && !picked.contains(&sentence)
                {
                    picked.push(sentence);
                }
            }
        }

        Ok(Answer {
            answer: picked.join(" "),
            sources: scored.iter().map(|(_, p)| p.path.clone()).collect(),
        })
    }
}

fn strip_heading(content: &str, title: &str) -> String {
    content
        .lines()
        .filter(|l| {
            let t = l.trim();
            !(t.starts_with('#') && t.trim_start_matches('#').trim() == title.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sentences of prose, ignoring Markdown headings, list markers and blank lines.
fn sentences(text: &str) -> Vec<String> {
    let prose: String = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("```"))
        .map(|l| l.trim_start_matches(['-', '*', '>']).trim())
        .collect::<Vec<_>>()
        .join(" ");

    let mut out = Vec::new();
    let mut current = String::new();
    for ch in prose.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let s = current.trim().to_string();
            if !s.is_empty() {
                out.push(s);
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn key_terms(text: &str, limit: usize) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for t in tokens(text).into_iter().filter(|t| t.len() > 3) {
        *counts.entry(t).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

// ============ HTTP ============

/// Calls `POST <endpoint>/generate` and `POST <endpoint>/answer`.
///
/// The bearer token is read from the environment variable named by
/// `summarizer.api_key_env` on every call.
pub struct HttpSummarizer {
    endpoint: String,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    pages: Vec<KbPage>,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarizer.endpoint required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            client,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        route: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{}", self.endpoint, route);
        let mut req = self.client.post(&url).json(body);
        if let Some(var) = &self.api_key_env {
            let key = std::env::var(var)
                .with_context(|| format!("{} environment variable not set", var))?;
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("Summarizer request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Summarizer error {} from {}: {}", status, url, text);
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("Invalid summarizer response from {}", url))
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<KbPage>> {
        let body = serde_json::to_value(request)?;
        let response: GenerateResponse = self.post("generate", &body).await?;
        Ok(response.pages)
    }

    async fn answer(&self, question: &str, pages: &[SourceDocument]) -> Result<Answer> {
        let body = serde_json::json!({ "question": question, "pages": pages });
        self.post("answer", &body).await
    }
}

/// Create the provider named by `summarizer.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledSummarizer`] |
/// | `"extractive"` | [`ExtractiveSummarizer`] |
/// | `"http"` | [`HttpSummarizer`] |
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Arc<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSummarizer)),
        "extractive" => Ok(Arc::new(ExtractiveSummarizer::new(config.max_sentences))),
        "http" => Ok(Arc::new(HttpSummarizer::new(config)?)),
        other => bail!("Unknown summarizer provider: {}", other),
    }
}
