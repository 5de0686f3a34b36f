//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow per document: record version → drop stale
//! entries → chunk → embed in batches → index. Re-ingestion of the same
//! document id is serialized by a per-document async lock, so concurrent
//! submissions never interleave their delete and upsert phases and the
//! index never holds a mix of two versions.
//!
//! Batch ingestion is lazy: [`IngestionPipeline::stream_ingest`] yields one
//! [`IngestOutcome`] per document as it completes, and one document's
//! failure never aborts the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::chunk::{chunk_document, fenced_code_spans, ChunkParams};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::{IndexEntry, VectorIndex};
use crate::models::{Document, IngestOutcome, IngestStatus};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress};

pub struct IngestionPipeline {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    target_size: usize,
    overlap: usize,
    batch_size: usize,
    reporter: Arc<dyn IngestProgressReporter>,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self {
            index,
            embedder,
            target_size: config.chunking.target_size,
            overlap: config.chunking.overlap,
            batch_size: config.embedding.batch_size,
            reporter: Arc::new(NoProgress),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn IngestProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Ingest one document into the given namespace. Returns the assigned
    /// version and the number of chunks indexed.
    ///
    /// Holds the document's lock for the whole delete + upsert sequence.
    /// On failure the document's entries are removed again, so the index
    /// never holds a partially ingested version.
    pub async fn ingest_one(
        &self,
        document: &Document,
        store: Option<&str>,
    ) -> Result<(i64, usize)> {
        let key = lock_key(store, &document.id);
        let lock = self.lock_for(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.ingest_locked(document, store).await
        };
        drop(lock);
        self.reap_lock(&key).await;
        result
    }

    async fn ingest_locked(
        &self,
        document: &Document,
        store: Option<&str>,
    ) -> Result<(i64, usize)> {
        self.reporter.report(IngestProgressEvent::Started {
            document_id: document.id.clone(),
        });

        let version = self.index.record_document(document).await?;
        self.index.delete_by_document(&document.id, store).await?;

        match self.index_document(document, store).await {
            Ok(total) => {
                self.reporter.report(IngestProgressEvent::Indexed {
                    document_id: document.id.clone(),
                    chunks: total as u64,
                    version,
                });
                info!(document_id = %document.id, version, chunks = total, "document indexed");
                Ok((version, total))
            }
            Err(e) => {
                // Roll back whatever was upserted before the failure.
                if let Err(cleanup) = self.index.delete_by_document(&document.id, store).await {
                    warn!(
                        document_id = %document.id,
                        error = %cleanup,
                        "rollback after failed ingest also failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn index_document(&self, document: &Document, store: Option<&str>) -> Result<usize> {
        let mut params = ChunkParams::new(self.target_size, self.overlap);
        if document.content_type.contains("markdown") {
            params = params.with_atomic_spans(fenced_code_spans(&document.body));
        }
        if let Some(store) = store {
            params = params.with_namespace(store);
        }
        let chunks = chunk_document(&document.id, &document.body, &params)?;
        let total = chunks.len();

        let mut indexed = 0u64;
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;

            for (chunk, vector) in batch.iter().zip(vectors) {
                self.index
                    .upsert(IndexEntry {
                        chunk_id: chunk.id.clone(),
                        document_id: chunk.document_id.clone(),
                        store_id: store.map(|s| s.to_string()),
                        seq: chunk.seq,
                        text: chunk.text.clone(),
                        vector,
                    })
                    .await?;
                indexed += 1;
            }
            self.reporter.report(IngestProgressEvent::Embedding {
                document_id: document.id.clone(),
                n: indexed,
                total: total as u64,
            });
        }
        Ok(total)
    }

    /// Ingest a batch lazily, yielding one outcome per document as it
    /// completes.
    pub fn stream_ingest(
        self: &Arc<Self>,
        documents: Vec<Document>,
        store: Option<String>,
    ) -> ReceiverStream<IngestOutcome> {
        let (tx, rx) = mpsc::channel(16);
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            for document in documents {
                let outcome = match pipeline.ingest_one(&document, store.as_deref()).await {
                    Ok((version, chunks)) => IngestOutcome {
                        document_id: document.id.clone(),
                        status: IngestStatus::Indexed { version, chunks },
                    },
                    Err(e) => {
                        warn!(document_id = %document.id, error = %e, "document failed");
                        pipeline.reporter.report(IngestProgressEvent::Failed {
                            document_id: document.id.clone(),
                            kind: e.kind().to_string(),
                        });
                        IngestOutcome {
                            document_id: document.id.clone(),
                            status: IngestStatus::Failed {
                                kind: e.kind().to_string(),
                                reason: e.to_string(),
                            },
                        }
                    }
                };
                if tx.send(outcome).await.is_err() {
                    break;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the lock entry once no ingest holds it. Cloning and reaping both
    /// happen under the map mutex, so a concurrent `lock_for` cannot race a
    /// removal.
    async fn reap_lock(&self, key: &str) {
        let mut locks = self.doc_locks.lock().await;
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

fn lock_key(store: Option<&str>, document_id: &str) -> String {
    format!("{}\u{0}{}", store.unwrap_or(""), document_id)
}
