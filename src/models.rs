//! Core data models used throughout the engine.
//!
//! These types represent the documents, chunks, and retrieval results that
//! flow through the ingestion and query pipelines.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A source document submitted for ingestion.
///
/// Immutable once ingested. Re-ingesting under the same `id` assigns a new
/// version rather than mutating the stored copy; the assigned version is
/// tracked by the index backend.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identity: source path or upload name.
    pub id: String,
    /// Source label (e.g. `"filesystem"`, `"upload"`).
    pub source: String,
    /// Declared MIME type (e.g. `"text/markdown"`).
    pub content_type: String,
    /// Raw body text. UTF-8 validity is enforced by the intake layer.
    pub body: String,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            content_type: content_type.into(),
            body: body.into(),
            ingested_at: Utc::now(),
        }
    }
}

/// A bounded segment of a document's body text.
///
/// Chunk ids are derived deterministically from
/// `(namespace, document_id, seq)`, so re-ingesting unchanged content
/// reproduces the same ids and the same document id in different index
/// namespaces never collides. Byte offsets point back into the source
/// body for traceability.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position of this chunk within its document, starting at 0.
    pub seq: i64,
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    /// SHA-256 of `text`, used for staleness and near-duplicate detection.
    pub hash: String,
}

/// A retrieval hit: one chunk with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub seq: i64,
    pub text: String,
    pub score: f32,
}

/// Ephemeral, per-request context assembled by the retriever.
///
/// Ordered by descending similarity, deduplicated, and bounded by a
/// character budget. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryContext {
    pub chunks: Vec<ScoredChunk>,
    pub total_chars: usize,
}

impl QueryContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Render the context as a prompt section, one source block per chunk.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.total_chars + 64 * self.chunks.len());
        for chunk in &self.chunks {
            out.push_str("Source: ");
            out.push_str(&chunk.document_id);
            out.push('\n');
            out.push_str(&chunk.text);
            out.push_str("\n\n");
        }
        out
    }
}

/// Per-document result emitted by the ingestion pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    #[serde(flatten)]
    pub status: IngestStatus,
}

/// Success or failure of a single document's ingestion. One document's
/// failure never aborts the rest of the batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestStatus {
    Indexed { version: i64, chunks: usize },
    Failed { kind: String, reason: String },
}

/// Summary of a file-search store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// A source reference attached to a generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub name: String,
    pub content: String,
}
