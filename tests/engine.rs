//! End-to-end tests over the engine facade with in-memory backends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use ragpipe::config::Config;
use ragpipe::embedding::HashProvider;
use ragpipe::engine::Engine;
use ragpipe::error::Result;
use ragpipe::generate::{
    Fragment, GenerativeBackend, ModelRequest, ModelResponse, ResponsePart,
};
use ragpipe::index::{MemoryIndex, VectorIndex};
use ragpipe::models::{Document, IngestStatus};
use ragpipe::progress::ProgressMode;
use ragpipe::router::{Capability, CapabilityOutcome, RequestSpec, SchemaChoice};
use ragpipe::store_mgr::MemoryRegistry;

/// Backend that echoes a canned answer and records assembled prompts.
struct EchoBackend {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

impl EchoBackend {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, request: &ModelRequest) {
        let body = ragpipe::generate::build_request_body(request);
        if let Some(text) = body
            .pointer("/contents/0/parts/0/text")
            .and_then(|t| t.as_str())
        {
            self.prompts.lock().unwrap().push(text.to_string());
        }
    }
}

#[async_trait]
impl GenerativeBackend for EchoBackend {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.record(request);
        Ok(ModelResponse {
            parts: vec![ResponsePart::Text(self.answer.clone())],
            url_metadata: Vec::new(),
        })
    }

    async fn generate_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<mpsc::Receiver<Result<Fragment>>> {
        self.record(request);
        let (tx, rx) = mpsc::channel(8);
        let answer = self.answer.clone();
        tokio::spawn(async move {
            for word in answer.split_inclusive(' ') {
                if tx
                    .send(Ok(Fragment {
                        text: word.to_string(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn engine_with(backend: Arc<EchoBackend>) -> (Engine, Arc<MemoryIndex>) {
    let mut config = Config::default();
    config.db.backend = "memory".to_string();
    config.chunking.target_size = 400;
    config.chunking.overlap = 80;
    config.embedding.dims = 64;
    config.generation.backoff_initial_ms = 1;
    config.generation.backoff_max_ms = 2;

    let index = Arc::new(MemoryIndex::new(64));
    let engine = Engine::assemble(
        config,
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        Arc::new(HashProvider::new(64, 8000)),
        backend,
        Arc::new(MemoryRegistry::default()),
        ProgressMode::Off,
    )
    .unwrap();
    (engine, index)
}

fn doc(id: &str, body: &str) -> Document {
    Document::new(id, "test", "text/plain", body)
}

#[tokio::test]
async fn ingest_is_idempotent_across_runs() {
    let (engine, index) = engine_with(Arc::new(EchoBackend::new("ok")));
    let body = "A paragraph about deployments. ".repeat(30);

    let first: Vec<_> = engine.ingest(vec![doc("d1", &body)]).collect().await;
    let count_after_first = index.count().await.unwrap();
    let second: Vec<_> = engine.ingest(vec![doc("d1", &body)]).collect().await;

    let chunks = |status: &IngestStatus| match status {
        IngestStatus::Indexed { chunks, .. } => *chunks,
        IngestStatus::Failed { .. } => panic!("unexpected failure"),
    };
    assert_eq!(chunks(&first[0].status), chunks(&second[0].status));
    assert_eq!(index.count().await.unwrap(), count_after_first);

    // Version advanced even though content did not change.
    match (&first[0].status, &second[0].status) {
        (IngestStatus::Indexed { version: v1, .. }, IngestStatus::Indexed { version: v2, .. }) => {
            assert_eq!(*v1, 1);
            assert_eq!(*v2, 2);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn search_returns_ranked_bounded_context() {
    let (engine, _) = engine_with(Arc::new(EchoBackend::new("ok")));
    let docs = vec![
        doc("runbook.md", "Deployment runbook for the payment service."),
        doc("recipes.md", "A recipe for sourdough bread and pastries."),
        doc("tuning.md", "Postgres tuning notes for heavy write loads."),
    ];
    let _: Vec<_> = engine.ingest(docs).collect().await;

    let context = engine
        .search("deployment runbook payment service")
        .await
        .unwrap();
    assert!(!context.is_empty());
    assert_eq!(context.chunks[0].document_id, "runbook.md");
    for pair in context.chunks.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    // Default budget: 2000 tokens at 4 chars per token.
    assert!(context.total_chars <= 8000);
}

#[tokio::test]
async fn rag_chat_streams_and_grounds_in_sources() {
    let backend = Arc::new(EchoBackend::new("use the blue deploy button"));
    let (engine, _) = engine_with(Arc::clone(&backend));
    let _: Vec<_> = engine
        .ingest(vec![doc(
            "deploy.md",
            "To deploy the service press the blue deploy button.",
        )])
        .collect()
        .await;

    let stream = engine
        .query_chat("how do I deploy the service?", true, Vec::new())
        .await
        .unwrap();
    let answer = stream.collect_text().await.unwrap();
    assert_eq!(answer, "use the blue deploy button");

    let prompts = backend.prompts.lock().unwrap();
    assert!(prompts[0].contains("Source: deploy.md"));
    assert!(prompts[0].contains("blue deploy button"));
}

#[tokio::test]
async fn chat_without_rag_sends_bare_prompt() {
    let backend = Arc::new(EchoBackend::new("hello there"));
    let (engine, _) = engine_with(Arc::clone(&backend));

    let stream = engine.query_chat("hi", false, Vec::new()).await.unwrap();
    assert_eq!(stream.collect_text().await.unwrap(), "hello there");
    assert_eq!(backend.prompts.lock().unwrap()[0], "hi");
}

#[tokio::test]
async fn classify_matches_priority_and_conflicts() {
    let (engine, _) = engine_with(Arc::new(EchoBackend::new("ok")));

    let spec = RequestSpec {
        prompt: "extract".to_string(),
        schema: Some(SchemaChoice::Named("invoice".to_string())),
        urls: vec!["https://example.com/invoice".to_string()],
        ..Default::default()
    };
    assert_eq!(
        engine.classify(&spec).unwrap(),
        Capability::StructuredExtraction
    );

    let conflicting = RequestSpec {
        prompt: "x".to_string(),
        schema: Some(SchemaChoice::Named("invoice".to_string())),
        execute_code: true,
        ..Default::default()
    };
    assert_eq!(engine.classify(&conflicting).unwrap_err().kind(), "conflict");
}

#[tokio::test]
async fn store_lifecycle_and_query_by_name() {
    let backend = Arc::new(EchoBackend::new("refunds take five business days"));
    let (engine, index) = engine_with(Arc::clone(&backend));

    engine.create_store("policies").await.unwrap();
    engine
        .upload_to_store(
            "policies",
            &doc("refund.md", "Refunds are processed within five business days."),
        )
        .await
        .unwrap();

    // The primary corpus stays empty; the store holds the chunk.
    assert!(engine.search("refunds").await.unwrap().is_empty());
    assert_eq!(index.count().await.unwrap(), 1);

    let outcome = engine
        .execute(RequestSpec {
            prompt: "how long do refunds take?".to_string(),
            stores: vec!["policies".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    match outcome {
        CapabilityOutcome::FileSearch { answer, citations } => {
            assert_eq!(answer, "refunds take five business days");
            assert_eq!(citations[0].name, "refund.md");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let removed = engine.delete_store("policies").await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(index.count().await.unwrap(), 0);
    assert!(engine.list_stores().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_store_reference_fails_before_dispatch() {
    let (engine, _) = engine_with(Arc::new(EchoBackend::new("ok")));
    let err = engine
        .execute(RequestSpec {
            prompt: "q".to_string(),
            stores: vec!["missing".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "data");
}

#[tokio::test]
async fn structured_extraction_end_to_end() {
    let backend = Arc::new(EchoBackend::new(
        r#"{"sentiment":"positive","summary":"fast and stable"}"#,
    ));
    let (engine, _) = engine_with(backend);

    let outcome = engine
        .execute(RequestSpec {
            prompt: "classify: the new release is fast and stable".to_string(),
            schema: Some(SchemaChoice::Named("feedback".to_string())),
            ..Default::default()
        })
        .await
        .unwrap();
    match outcome {
        CapabilityOutcome::Structured { data, schema_type } => {
            assert_eq!(data["sentiment"], "positive");
            assert_eq!(schema_type.as_deref(), Some("feedback"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn batch_ingest_reports_partial_failures() {
    let mut config = Config::default();
    config.db.backend = "memory".to_string();
    config.chunking.target_size = 400;
    config.chunking.overlap = 80;
    config.embedding.dims = 64;

    let index = Arc::new(MemoryIndex::new(64));
    // Tight embedding input limit so the oversized document fails.
    let engine = Engine::assemble(
        config,
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        Arc::new(HashProvider::new(64, 100)),
        Arc::new(EchoBackend::new("ok")),
        Arc::new(MemoryRegistry::default()),
        ProgressMode::Off,
    )
    .unwrap();

    let outcomes: Vec<_> = engine
        .ingest(vec![
            doc("small", "fits fine"),
            doc("huge", &"x".repeat(1000)),
            doc("small-2", "also fits"),
        ])
        .collect()
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0].status, IngestStatus::Indexed { .. }));
    assert!(matches!(outcomes[1].status, IngestStatus::Failed { .. }));
    assert!(matches!(outcomes[2].status, IngestStatus::Indexed { .. }));
    assert_eq!(index.count().await.unwrap(), 2);
}
