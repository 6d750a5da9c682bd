//! Document ingestion: `load_document(path)` plus markdown section handling.

pub mod docx;
pub mod pdf;
pub mod sections;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use redline_core::error::{RedlineError, Result};

pub use sections::{assemble, split_sections, Section};

/// Formats `load_document` can extract text from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Markdown,
    PlainText,
    Docx,
    Pdf,
}

impl DocumentFormat {
    /// Detect the format from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "md" | "markdown" => Ok(Self::Markdown),
            "txt" | "text" => Ok(Self::PlainText),
            "docx" => Ok(Self::Docx),
            "pdf" => Ok(Self::Pdf),
            "" => Err(RedlineError::UnsupportedFormat(format!(
                "{} (no file extension)",
                path.display()
            ))),
            other => Err(RedlineError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Markdown => "markdown",
            Self::PlainText => "text",
            Self::Docx => "docx",
            Self::Pdf => "pdf",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub path: PathBuf,
    pub format: DocumentFormat,
    /// Pages for pdf, paragraphs for docx, lines for text formats.
    pub units: usize,
}

/// Extracted document text and where it came from.
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// Load a document from disk and extract its text.
///
/// The returned text is trimmed and never empty.
pub fn load_document(path: impl AsRef<Path>) -> Result<Document> {
    let path = path.as_ref();

    let meta = std::fs::metadata(path)
        .map_err(|_| RedlineError::DocumentNotFound(path.display().to_string()))?;
    if !meta.is_file() {
        return Err(RedlineError::DocumentNotFound(path.display().to_string()));
    }

    let format = DocumentFormat::from_path(path)?;

    if meta.len() == 0 {
        return Err(RedlineError::EmptyDocument(path.display().to_string()));
    }

    let bytes = std::fs::read(path)?;
    let corrupted = |reason: String| RedlineError::CorruptedDocument {
        path: path.display().to_string(),
        reason,
    };

    let (text, units) = match format {
        DocumentFormat::Markdown | DocumentFormat::PlainText => {
            let text = String::from_utf8(bytes)
                .map_err(|e| corrupted(format!("invalid UTF-8: {}", e)))?;
            let units = text.lines().count();
            (text, units)
        }
        DocumentFormat::Docx => {
            let paragraphs = docx::extract_paragraphs(&bytes).map_err(|e| corrupted(e.0))?;
            let units = paragraphs.len();
            (paragraphs.join("\n"), units)
        }
        DocumentFormat::Pdf => {
            let pages = pdf::extract_pages(&bytes).map_err(|e| corrupted(e.0))?;
            let units = pages.len();
            let text = pages
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            (text, units)
        }
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(RedlineError::EmptyDocument(path.display().to_string()));
    }

    debug!(path = %path.display(), %format, units, chars = text.len(), "Loaded document");

    Ok(Document {
        text: text.to_string(),
        metadata: DocumentMetadata {
            path: path.to_path_buf(),
            format,
            units,
        },
    })
}
