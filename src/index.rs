//! Vector index abstraction and the in-memory backend.
//!
//! A [`VectorIndex`] stores embedded chunks keyed by chunk id, partitioned
//! into namespaces: the primary corpus (`store = None`) and named
//! file-search stores. Queries score candidates by cosine similarity and
//! return the top `k`, ordered by descending score with ties broken by
//! ascending chunk id so results are fully deterministic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::models::{Document, ScoredChunk};

/// One embedded chunk as stored in the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    /// Namespace: `None` for the primary corpus, `Some(id)` for a
    /// file-search store.
    pub store_id: Option<String>,
    pub seq: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Storage backend for embedded chunks.
///
/// Writes are visible to subsequent queries as soon as the call returns.
/// Upserting an existing chunk id overwrites the stored entry.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimensionality every stored and queried vector must match.
    fn dims(&self) -> usize;

    /// Insert or overwrite one entry. Fails with a dimension mismatch if
    /// the vector length differs from [`dims`](Self::dims).
    async fn upsert(&self, entry: IndexEntry) -> Result<()>;

    /// Top-`k` nearest entries within the given namespace.
    async fn query(&self, vector: &[f32], k: usize, store: Option<&str>)
        -> Result<Vec<ScoredChunk>>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, chunk_id: &str) -> Result<bool>;

    /// Remove every entry belonging to a document within a namespace.
    /// Returns the number removed. Atomic with respect to queries: readers
    /// see either all of the document's entries or none.
    async fn delete_by_document(&self, document_id: &str, store: Option<&str>) -> Result<u64>;

    /// Remove every entry in a file-search store.
    async fn delete_by_store(&self, store_id: &str) -> Result<u64>;

    /// Record (or re-record) a document and return its assigned version,
    /// starting at 1 and incrementing on each re-ingestion of the same id.
    async fn record_document(&self, document: &Document) -> Result<i64>;

    /// Total number of entries across all namespaces.
    async fn count(&self) -> Result<u64>;
}

fn check_dims(expected: usize, got: usize) -> Result<()> {
    if got != expected {
        return Err(EngineError::DimensionMismatch { expected, got });
    }
    Ok(())
}

/// Rank candidates: descending score, ascending chunk id on ties.
pub(crate) fn rank_hits(hits: &mut Vec<ScoredChunk>, k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, IndexEntry>,
    doc_versions: HashMap<String, i64>,
}

/// Ephemeral index used by tests and `backend = "memory"` deployments.
pub struct MemoryIndex {
    dims: usize,
    state: RwLock<MemoryState>,
}

impl MemoryIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            state: RwLock::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        check_dims(self.dims, entry.vector.len())?;
        let mut state = self.state.write().await;
        state.entries.insert(entry.chunk_id.clone(), entry);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        store: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        check_dims(self.dims, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut hits: Vec<ScoredChunk> = state
            .entries
            .values()
            .filter(|e| e.store_id.as_deref() == store)
            .map(|e| ScoredChunk {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                seq: e.seq,
                text: e.text.clone(),
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.entries.remove(chunk_id).is_some())
    }

    async fn delete_by_document(&self, document_id: &str, store: Option<&str>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !(e.document_id == document_id && e.store_id.as_deref() == store));
        Ok((before - state.entries.len()) as u64)
    }

    async fn delete_by_store(&self, store_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.store_id.as_deref() != Some(store_id));
        Ok((before - state.entries.len()) as u64)
    }

    async fn record_document(&self, document: &Document) -> Result<i64> {
        let mut state = self.state.write().await;
        let version = state
            .doc_versions
            .entry(document.id.clone())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        Ok(*version)
    }

    async fn count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.entries.len() as u64)
    }
}
