//! Overlap-aware text chunker.
//!
//! Splits a document body into [`Chunk`]s using a fixed stride of
//! `target_size - overlap` bytes between chunk start offsets. Each chunk's
//! end is snapped backward to the nearest paragraph, sentence, or word
//! boundary inside the trailing overlap window, so chunks never cut
//! mid-word while start offsets keep an exact, predictable stride.
//!
//! Atomic spans (e.g. fenced code blocks) supplied by the caller are never
//! split: a chunk end landing inside a span is moved to the span edge.
//!
//! Chunk ids are derived deterministically from
//! `(namespace, document_id, seq)`, so re-ingesting unchanged content
//! reproduces identical ids while the same document id in different
//! namespaces (primary corpus vs. file-search stores) never collides.

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::models::Chunk;

/// Approximate chars-per-token ratio used to convert token budgets to
/// character budgets.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters. Sizes are UTF-8 byte lengths; multi-byte characters
/// are never split.
#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub target_size: usize,
    pub overlap: usize,
    /// Half-open byte ranges that must not be split across a chunk end.
    pub atomic_spans: Vec<(usize, usize)>,
    /// Id namespace, e.g. a file-search store id. `None` is the primary
    /// corpus. Folded into every chunk id so namespaces never collide.
    pub namespace: Option<String>,
}

impl ChunkParams {
    pub fn new(target_size: usize, overlap: usize) -> Self {
        Self {
            target_size,
            overlap,
            atomic_spans: Vec::new(),
            namespace: None,
        }
    }

    pub fn with_atomic_spans(mut self, spans: Vec<(usize, usize)>) -> Self {
        self.atomic_spans = spans;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Split `text` into chunks with contiguous seq indices starting at 0.
///
/// Guarantees:
/// - text shorter than `target_size` yields exactly one chunk;
/// - each chunk's start offset is at least `target_size - overlap` past the
///   previous chunk's start;
/// - logical coverage is contiguous: every byte of `text` is inside at
///   least one chunk, and adjacent chunk texts overlap by at most the
///   overlap window (more only when an atomic span forces an extension).
///
/// Pure function over its input. Fails only on invalid parameters
/// (`0 < overlap < target_size` is required).
pub fn chunk_document(document_id: &str, text: &str, params: &ChunkParams) -> Result<Vec<Chunk>> {
    if params.target_size == 0 || params.overlap == 0 || params.overlap >= params.target_size {
        return Err(EngineError::data(format!(
            "invalid chunking parameters: require 0 < overlap < target_size, got overlap={} target_size={}",
            params.overlap, params.target_size
        )));
    }

    let stride = params.target_size - params.overlap;
    let len = text.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut seq: i64 = 0;

    let namespace = params.namespace.as_deref();

    loop {
        if len - start <= params.target_size {
            chunks.push(make_chunk(namespace, document_id, seq, text, start, len));
            break;
        }

        let hard_end = floor_char_boundary(text, start + params.target_size);
        let window_start = ceil_char_boundary(text, start + stride);
        let mut next_start = window_start;
        let mut end = snap_to_boundary(text, window_start, hard_end);

        // Keep atomic constructs whole: move the cut to the span edge.
        for &(span_start, span_end) in &params.atomic_spans {
            if span_start < end && end < span_end {
                if span_start >= next_start {
                    end = span_start;
                } else {
                    end = span_end.min(len);
                    next_start = end;
                }
                break;
            }
        }

        chunks.push(make_chunk(namespace, document_id, seq, text, start, end));
        seq += 1;

        if next_start >= len {
            break;
        }
        start = next_start;
    }

    Ok(chunks)
}

/// Byte spans of fenced code blocks (``` ... ```), including the fence
/// lines. An unclosed fence extends to the end of the text.
pub fn fenced_code_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut fence_start: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            match fence_start.take() {
                None => fence_start = Some(offset),
                Some(start) => spans.push((start, offset + line.len())),
            }
        }
        offset += line.len();
    }

    if let Some(start) = fence_start {
        spans.push((start, text.len()));
    }
    spans
}

/// Deterministic chunk id derived from `(namespace, document_id, seq)`.
pub fn chunk_id(namespace: Option<&str>, document_id: &str, seq: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(seq.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn make_chunk(
    namespace: Option<&str>,
    document_id: &str,
    seq: i64,
    text: &str,
    start: usize,
    end: usize,
) -> Chunk {
    let slice = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(slice.as_bytes());

    Chunk {
        id: chunk_id(namespace, document_id, seq),
        document_id: document_id.to_string(),
        seq,
        text: slice.to_string(),
        start_byte: start,
        end_byte: end,
        hash: format!("{:x}", hasher.finalize()),
    }
}

/// Pick a cut point in `[window_start, hard_end]`, preferring paragraph
/// breaks, then sentence ends, then line breaks, then spaces. Falls back to
/// `hard_end` when the window contains no boundary at all.
fn snap_to_boundary(text: &str, window_start: usize, hard_end: usize) -> usize {
    let window = &text[window_start..hard_end];

    if let Some(pos) = window.rfind("\n\n") {
        return window_start + pos;
    }
    if let Some(pos) = window.rfind(". ").or_else(|| window.rfind(".\n")) {
        return window_start + pos + 1;
    }
    if let Some(pos) = window.rfind('\n') {
        return window_start + pos + 1;
    }
    if let Some(pos) = window.rfind(' ') {
        return window_start + pos + 1;
    }
    hard_end
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(target, overlap)
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_document("doc1", "Hello, world!", &params(3000, 200)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].start_byte, 0);
        assert_eq!(chunks[0].end_byte, 13);
    }

    #[test]
    fn empty_text_single_chunk() {
        let chunks = chunk_document("doc1", "", &params(100, 10)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn invalid_params_rejected() {
        assert!(chunk_document("d", "x", &params(100, 0)).is_err());
        assert!(chunk_document("d", "x", &params(100, 100)).is_err());
        assert!(chunk_document("d", "x", &params(0, 0)).is_err());
    }

    #[test]
    fn ten_thousand_chars_four_chunks() {
        // 10,000 chars at target 3000 / overlap 200: starts at
        // 0, 2800, 5600, 8400.
        let text = "a".repeat(10_000);
        let chunks = chunk_document("doc1", &text, &params(3000, 200)).unwrap();
        assert_eq!(chunks.len(), 4);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start_byte >= pair[0].start_byte + (3000 - 200),
                "stride violated: {} then {}",
                pair[0].start_byte,
                pair[1].start_byte
            );
        }
        assert_eq!(chunks.last().unwrap().end_byte, 10_000);
    }

    #[test]
    fn contiguous_coverage_no_data_loss() {
        let text: String = (0..400)
            .map(|i| format!("Sentence number {i} fills the document. "))
            .collect();
        let chunks = chunk_document("doc1", &text, &params(600, 120)).unwrap();
        assert!(chunks.len() > 1);

        // No gaps: each chunk begins at or before the previous chunk's end.
        assert_eq!(chunks[0].start_byte, 0);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_byte <= pair[0].end_byte);
        }
        assert_eq!(chunks.last().unwrap().end_byte, text.len());

        // Total text minus overlaps equals the original length.
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        let overlap_total: usize = chunks
            .windows(2)
            .map(|p| p[0].end_byte.saturating_sub(p[1].start_byte))
            .sum();
        assert_eq!(total - overlap_total, text.len());
    }

    #[test]
    fn never_cuts_mid_word() {
        let text: String = (0..500)
            .map(|i| format!("word{i} alpha beta gamma. "))
            .collect();
        let chunks = chunk_document("doc1", &text, &params(300, 60)).unwrap();
        for chunk in &chunks[..chunks.len() - 1] {
            let trailing = chunk.text.chars().last().unwrap();
            assert!(
                !trailing.is_alphanumeric() || chunk.end_byte == text.len(),
                "mid-word cut in chunk {}: ...{:?}",
                chunk.seq,
                &chunk.text[chunk.text.len().saturating_sub(12)..]
            );
        }
    }

    #[test]
    fn atomic_span_not_split() {
        let prefix = "Intro paragraph. ".repeat(20); // 340 bytes
        let code = format!("```\n{}\n```\n", "let x = compute();\n".repeat(10));
        let suffix = "Closing remarks. ".repeat(40);
        let text = format!("{prefix}{code}{suffix}");
        let spans = fenced_code_spans(&text);
        assert_eq!(spans.len(), 1);

        let p = params(400, 80).with_atomic_spans(spans.clone());
        let chunks = chunk_document("doc1", &text, &p).unwrap();
        let (span_start, span_end) = spans[0];
        for chunk in &chunks {
            let cut = chunk.end_byte;
            assert!(
                cut <= span_start || cut >= span_end || cut == text.len(),
                "chunk {} ends inside the code block at byte {}",
                chunk.seq,
                cut
            );
        }
    }

    #[test]
    fn fenced_spans_detected() {
        let text = "before\n```rust\nfn main() {}\n```\nafter\n";
        let spans = fenced_code_spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].0..spans[0].1], "```rust\nfn main() {}\n```\n");
    }

    #[test]
    fn unclosed_fence_extends_to_end() {
        let text = "before\n```\nno closing fence";
        let spans = fenced_code_spans(text);
        assert_eq!(spans, vec![(7, text.len())]);
    }

    #[test]
    fn deterministic_ids_across_runs() {
        let text = "Alpha. ".repeat(200);
        let a = chunk_document("doc1", &text, &params(300, 50)).unwrap();
        let b = chunk_document("doc1", &text, &params(300, 50)).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.seq, y.seq);
        }
        // Different documents get different ids for the same seq.
        assert_ne!(chunk_id(None, "doc1", 0), chunk_id(None, "doc2", 0));
    }

    #[test]
    fn namespace_scopes_chunk_ids() {
        // The same document id in different namespaces must never produce
        // colliding chunk ids.
        assert_ne!(chunk_id(None, "doc1", 0), chunk_id(Some("s1"), "doc1", 0));
        assert_ne!(
            chunk_id(Some("s1"), "doc1", 0),
            chunk_id(Some("s2"), "doc1", 0)
        );
        assert_eq!(
            chunk_id(Some("s1"), "doc1", 0),
            chunk_id(Some("s1"), "doc1", 0)
        );

        let text = "Scoped body text.";
        let plain = chunk_document("doc1", text, &params(3000, 200)).unwrap();
        let scoped =
            chunk_document("doc1", text, &params(3000, 200).with_namespace("s1")).unwrap();
        assert_ne!(plain[0].id, scoped[0].id);
        assert_eq!(plain[0].text, scoped[0].text);
    }

    #[test]
    fn multibyte_text_never_panics() {
        let text = "héllo wörld à la carte — ".repeat(300);
        let chunks = chunk_document("doc1", &text, &params(256, 64)).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.last().unwrap().end_byte, text.len());
    }
}
