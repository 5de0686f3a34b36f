//! Engine facade: wires the pipeline, retriever, router, cache, and store
//! manager together behind the surface the CLI (or an embedding
//! application) talks to.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{EngineError, Result};
use crate::generate::{GenerativeBackend, HttpBackend, ModelRequest, Turn};
use crate::index::{MemoryIndex, VectorIndex};
use crate::index_sqlite::SqliteIndex;
use crate::ingest::IngestionPipeline;
use crate::intake;
use crate::models::{Document, IngestOutcome, QueryContext, StoreSummary};
use crate::progress::ProgressMode;
use crate::retrieve::Retriever;
use crate::router::{Capability, CapabilityOutcome, RequestSpec, Router};
use crate::store_mgr::{MemoryRegistry, SqliteRegistry, StoreManager, StoreRegistry};
use crate::stream::{relay, ResponseStream};
use crate::{db, migrate};

pub struct Engine {
    config: Config,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<IngestionPipeline>,
    retriever: Arc<Retriever>,
    router: Router,
    stores: StoreManager,
    backend: Arc<dyn GenerativeBackend>,
}

impl Engine {
    /// Build an engine from configuration: opens (and migrates) the
    /// database for the sqlite backend, instantiates the embedding
    /// provider and the HTTP generative backend.
    pub async fn from_config(config: Config, progress: ProgressMode) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let backend: Arc<dyn GenerativeBackend> = Arc::new(HttpBackend::new(&config.generation)?);

        let (index, registry): (Arc<dyn VectorIndex>, Arc<dyn StoreRegistry>) =
            if config.db.backend == "memory" {
                (
                    Arc::new(MemoryIndex::new(config.embedding.dims)),
                    Arc::new(MemoryRegistry::default()),
                )
            } else {
                let pool = db::connect(&config).await?;
                migrate::run_migrations(&pool).await?;
                (
                    Arc::new(SqliteIndex::new(pool.clone(), config.embedding.dims)),
                    Arc::new(SqliteRegistry::new(pool)),
                )
            };

        Ok(Self::assemble(
            config, index, embedder, backend, registry, progress,
        )?)
    }

    /// Wire an engine from already constructed parts. Used by tests and
    /// embedders that bring their own backends.
    pub fn assemble(
        config: Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn GenerativeBackend>,
        registry: Arc<dyn StoreRegistry>,
        progress: ProgressMode,
    ) -> Result<Self> {
        let pipeline = Arc::new(
            IngestionPipeline::new(Arc::clone(&index), Arc::clone(&embedder), &config)
                .with_reporter(progress.reporter().into()),
        );
        let retriever = Arc::new(Retriever::new(
            Arc::clone(&index),
            embedder,
            config.retrieval.clone(),
        ));
        let router = Router::new(Arc::clone(&backend), Arc::clone(&retriever), &config)?;
        let stores = StoreManager::new(registry, Arc::clone(&index), Arc::clone(&pipeline));

        Ok(Self {
            config,
            index,
            pipeline,
            retriever,
            router,
            stores,
            backend,
        })
    }

    /// Ingest documents into the primary corpus, yielding one outcome per
    /// document as it completes.
    pub fn ingest(&self, documents: Vec<Document>) -> ReceiverStream<IngestOutcome> {
        self.pipeline.stream_ingest(documents, None)
    }

    /// Scan a file or directory and ingest everything found.
    pub fn ingest_path(&self, path: &std::path::Path) -> Result<ReceiverStream<IngestOutcome>> {
        let mut documents = Vec::new();
        for file in intake::scan_path(path)? {
            documents.extend(intake::load_documents(&file)?);
        }
        Ok(self.ingest(documents))
    }

    /// Streaming chat, optionally grounded in the primary corpus.
    pub async fn query_chat(
        &self,
        prompt: &str,
        use_rag: bool,
        history: Vec<Turn>,
    ) -> Result<ResponseStream> {
        let prompt = if use_rag {
            let context = self.retriever.retrieve(prompt).await?;
            if context.is_empty() {
                prompt.to_string()
            } else {
                format!(
                    "Answer using the sources below. If they are not sufficient, say so.\n\n{}Question: {}",
                    context.render(),
                    prompt
                )
            }
        } else {
            prompt.to_string()
        };

        let mut turns = history;
        turns.push(Turn::user_text(prompt));
        let request = ModelRequest::new(turns, &self.config.generation);

        // Retry opening the stream; once fragments flow, failures are
        // terminal and surface through the stream itself.
        let mut delay = Duration::from_millis(self.config.generation.backoff_initial_ms);
        let max_delay = Duration::from_millis(self.config.generation.backoff_max_ms);
        let mut last_err = None;
        for attempt in 0..=self.config.generation.max_retries {
            if attempt > 0 {
                sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
            match self.backend.generate_stream(&request).await {
                Ok(rx) => return Ok(relay(rx)),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "stream open failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| EngineError::upstream_transient("stream open failed after retries")))
    }

    /// Classify a request without executing it.
    pub fn classify(&self, spec: &RequestSpec) -> Result<Capability> {
        self.router.classify(spec)
    }

    /// Classify and execute a request. Store references are resolved to
    /// ids before dispatch so the file-search path works with ids only.
    pub async fn execute(&self, mut spec: RequestSpec) -> Result<CapabilityOutcome> {
        if !spec.stores.is_empty() {
            spec.stores = self.stores.resolve_ids(&spec.stores).await?;
        }
        self.router.execute(spec).await
    }

    /// Retrieve a packed context from the primary corpus without invoking
    /// the model.
    pub async fn search(&self, query: &str) -> Result<QueryContext> {
        self.retriever.retrieve(query).await
    }

    pub async fn create_store(&self, name: &str) -> Result<StoreSummary> {
        self.stores.create_store(name).await
    }

    pub async fn list_stores(&self) -> Result<Vec<StoreSummary>> {
        self.stores.list_stores().await
    }

    pub async fn delete_store(&self, store_ref: &str) -> Result<u64> {
        self.stores.delete_store(store_ref).await
    }

    pub async fn upload_to_store(
        &self,
        store_ref: &str,
        document: &Document,
    ) -> Result<(i64, usize)> {
        self.stores.upload(store_ref, document).await
    }

    /// Total indexed chunks across all namespaces.
    pub async fn indexed_chunks(&self) -> Result<u64> {
        self.index.count().await
    }
}
