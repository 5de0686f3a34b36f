//! Context retrieval: embed the query, rank candidates, pack a budget.
//!
//! Candidates are over-fetched beyond `k` to survive deduplication, then
//! greedily packed into a character budget derived from the configured
//! token budget. A chunk that does not fit is skipped whole, never
//! truncated; packing continues with smaller chunks further down the
//! ranking. An empty index yields an empty context, not an error.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::chunk::CHARS_PER_TOKEN;
use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::index::{rank_hits, VectorIndex};
use crate::models::{QueryContext, ScoredChunk};

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Build a query context from the primary corpus.
    pub async fn retrieve(&self, query: &str) -> Result<QueryContext> {
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let overfetch = self.config.k * self.config.overfetch_factor;
        let hits = self.index.query(&vector, overfetch, None).await?;
        Ok(self.pack(hits))
    }

    /// Build a query context by fanning out across file-search stores
    /// concurrently and merging the rankings.
    pub async fn retrieve_stores(&self, query: &str, store_ids: &[String]) -> Result<QueryContext> {
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let overfetch = self.config.k * self.config.overfetch_factor;

        let queries = store_ids
            .iter()
            .map(|store| self.index.query(&vector, overfetch, Some(store)));
        let results = try_join_all(queries).await?;

        let mut merged: Vec<ScoredChunk> = results.into_iter().flatten().collect();
        rank_hits(&mut merged, overfetch);
        Ok(self.pack(merged))
    }

    /// Deduplicate and greedily pack ranked candidates into the budget.
    fn pack(&self, hits: Vec<ScoredChunk>) -> QueryContext {
        let char_budget = self.config.token_budget * CHARS_PER_TOKEN;
        let mut seen_ids = HashSet::new();
        let mut seen_texts = HashSet::new();
        let mut context = QueryContext::default();

        for hit in hits {
            if context.chunks.len() >= self.config.k {
                break;
            }
            if !seen_ids.insert(hit.chunk_id.clone()) {
                continue;
            }
            let text_hash = Sha256::digest(hit.text.as_bytes());
            if !seen_texts.insert(text_hash) {
                continue;
            }
            if context.total_chars + hit.text.len() > char_budget {
                // Too big for the remaining budget; try smaller chunks.
                continue;
            }
            context.total_chars += hit.text.len();
            context.chunks.push(hit);
        }

        debug!(
            chunks = context.chunks.len(),
            chars = context.total_chars,
            "packed query context"
        );
        context
    }
}
