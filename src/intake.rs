//! Document intake: filesystem scanning, bundle splitting, attachments.
//!
//! Two text layouts are recognized:
//! - plain files (one document per file);
//! - bundle files, where many logical files are concatenated with
//!   `================` separators and each section opens with a
//!   `FILE: path` header line. Bundles split into one document per
//!   section.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::models::Document;

const BUNDLE_SEPARATOR: &str = "================";

/// A binary attachment submitted alongside a request (e.g. a PDF).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn size_mb(&self) -> f64 {
        self.data.len() as f64 / (1024.0 * 1024.0)
    }
}

/// Recursively collect ingestible text files under `path`. A single file
/// path is returned as-is.
pub fn scan_path(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::data(format!("scan failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if matches!(ext.as_str(), "md" | "markdown" | "txt") {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Load one file into documents: a bundle yields one document per section,
/// anything else yields a single document.
pub fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let bytes =
        std::fs::read(path).map_err(|e| EngineError::data(format!("{}: {e}", path.display())))?;
    let body = String::from_utf8(bytes)
        .map_err(|_| EngineError::data(format!("{}: not valid UTF-8", path.display())))?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "text/markdown",
        _ => "text/plain",
    };
    let id = path.display().to_string();

    if body.contains(BUNDLE_SEPARATOR) {
        Ok(split_bundle(&id, &body))
    } else {
        Ok(vec![Document::new(id, "filesystem", content_type, body)])
    }
}

/// Split a bundle into per-section documents. Sections without a `FILE:`
/// header get a positional name; blank or header-only sections are
/// dropped.
pub fn split_bundle(bundle_id: &str, content: &str) -> Vec<Document> {
    let mut documents = Vec::new();

    for (idx, section) in content.split(BUNDLE_SEPARATOR).enumerate() {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }
        let mut lines = section.lines();
        let header = lines.next().unwrap_or("").trim();
        let body: String = lines.collect::<Vec<_>>().join("\n");
        if body.trim().is_empty() {
            continue;
        }

        let name = header
            .strip_prefix("FILE:")
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| format!("section_{idx}"));

        documents.push(Document::new(
            format!("{bundle_id}#{name}"),
            "bundle",
            "text/plain",
            body,
        ));
    }
    documents
}

/// Read a PDF file as an attachment.
pub fn read_pdf_attachment(path: &Path) -> Result<Attachment> {
    let data =
        std::fs::read(path).map_err(|e| EngineError::data(format!("{}: {e}", path.display())))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment.pdf")
        .to_string();
    Ok(Attachment {
        name,
        mime_type: "application/pdf".to_string(),
        data,
    })
}
