//! Ingestion progress reporting.
//!
//! Reports per-document progress while a batch is being chunked, embedded,
//! and indexed. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts consuming the outcome stream.

use std::io::Write;

/// A single progress event for ingestion.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// A document entered the pipeline.
    Started { document_id: String },
    /// Embedding phase: n chunks embedded out of total.
    Embedding {
        document_id: String,
        n: u64,
        total: u64,
    },
    /// All of a document's chunks are indexed.
    Indexed {
        document_id: String,
        chunks: u64,
        version: i64,
    },
    /// The document failed; the rest of the batch continues.
    Failed { document_id: String, kind: String },
}

/// Reports ingestion progress. Implementations write to stderr.
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress: "ingest docs/runbook.md  embedding  128 / 512 chunks".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Started { document_id } => {
                format!("ingest {}  starting...\n", document_id)
            }
            IngestProgressEvent::Embedding {
                document_id,
                n,
                total,
            } => format!(
                "ingest {}  embedding  {} / {} chunks\n",
                document_id,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Indexed {
                document_id,
                chunks,
                version,
            } => format!(
                "ingest {}  indexed  {} chunks (v{})\n",
                document_id,
                format_number(*chunks),
                version
            ),
            IngestProgressEvent::Failed { document_id, kind } => {
                format!("ingest {}  failed ({})\n", document_id, kind)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Started { document_id } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "started"
            }),
            IngestProgressEvent::Embedding {
                document_id,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "embedding",
                "n": n,
                "total": total
            }),
            IngestProgressEvent::Indexed {
                document_id,
                chunks,
                version,
            } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "indexed",
                "chunks": chunks,
                "version": version
            }),
            IngestProgressEvent::Failed { document_id, kind } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "failed",
                "kind": kind
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
