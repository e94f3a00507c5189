//! Text extraction for uploaded documents.
//!
//! Uploads arrive as bytes plus a filename and optional content type.
//! Text formats pass through, HTML becomes Markdown, and PDF and DOCX are
//! reduced to plain text so the raw artifact stored in the repository is
//! always readable UTF-8.

use std::io::Read;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "text", "rst", "org", "adoc", "csv", "json", "yaml", "yml", "toml",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("HTML conversion failed: {0}")]
    Html(String),
    #[error("document is not valid UTF-8 text")]
    NotUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Html,
    Pdf,
    Docx,
}

impl DocumentKind {
    /// Whether the stored raw artifact is a converted `.md` file rather
    /// than the upload under its own name.
    pub fn is_converted(self) -> bool {
        !matches!(self, DocumentKind::Text)
    }
}

/// Decide how to read an upload. The content type wins over the extension.
pub fn detect_kind(filename: &str, content_type: Option<&str>) -> Option<DocumentKind> {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
        match ct.as_str() {
            MIME_PDF => return Some(DocumentKind::Pdf),
            MIME_DOCX => return Some(DocumentKind::Docx),
            MIME_HTML => return Some(DocumentKind::Html),
            t if t.starts_with("text/") => return Some(DocumentKind::Text),
            _ => {}
        }
    }

    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => Some(DocumentKind::Pdf),
        "docx" => Some(DocumentKind::Docx),
        "html" | "htm" => Some(DocumentKind::Html),
        e if TEXT_EXTENSIONS.contains(&e) => Some(DocumentKind::Text),
        _ => None,
    }
}

/// Extract UTF-8 text from an upload of a known kind.
pub fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractError> {
    match kind {
        DocumentKind::Text => String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::NotUtf8),
        DocumentKind::Html => {
            let html = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotUtf8)?;
            html_to_markdown(html)
        }
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::Docx => extract_docx(bytes),
    }
}

pub fn html_to_markdown(html: &str) -> Result<String, ExtractError> {
    htmd::convert(html).map_err(|e| ExtractError::Html(e.to_string()))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(e.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&xml)
}

/// Text of every `<w:t>` run, one paragraph (`<w:p>`) per block.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = current.trim().to_string();
                    if !text.is_empty() {
                        paragraphs.push(text);
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}
