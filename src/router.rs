//! Capability routing: classify a request, assemble the model invocation,
//! execute it with retry.
//!
//! Each request is classified independently into one of six execution
//! paths based on explicit request fields. When several triggers are
//! present, a configurable priority order picks the path; mutually
//! exclusive triggers are a [`EngineError::Conflict`], never silently
//! resolved. The router owns the retry policy for transient backend
//! failures: exponential backoff between the configured bounds, up to the
//! configured attempt count. Non-retryable errors propagate immediately.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::{fingerprint, ResponseCache};
use crate::config::{Config, GenerationConfig, RouterConfig};
use crate::error::{EngineError, Result};
use crate::generate::{
    GenerativeBackend, ModelRequest, ModelResponse, RequestPart, ResponsePart, ToolSpec, Turn,
    UrlMetadata,
};
use crate::intake::Attachment;
use crate::models::SourceRef;
use crate::retrieve::Retriever;
use crate::schemas;

/// The six execution paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    PdfAnalysis,
    StructuredExtraction,
    CodeExecution,
    UrlAnalysis,
    FileSearch,
}

impl Capability {
    pub fn label(self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::PdfAnalysis => "pdf",
            Capability::StructuredExtraction => "structured",
            Capability::CodeExecution => "code",
            Capability::UrlAnalysis => "url",
            Capability::FileSearch => "file_search",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "chat" => Some(Capability::Chat),
            "pdf" => Some(Capability::PdfAnalysis),
            "structured" => Some(Capability::StructuredExtraction),
            "code" => Some(Capability::CodeExecution),
            "url" => Some(Capability::UrlAnalysis),
            "file_search" => Some(Capability::FileSearch),
            _ => None,
        }
    }
}

/// Priority order among simultaneously triggered capabilities,
/// highest first.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    order: Vec<Capability>,
}

impl RoutePolicy {
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let mut order = Vec::with_capacity(config.priority.len());
        for name in &config.priority {
            let capability = Capability::parse(name).ok_or_else(|| {
                EngineError::data(format!("unknown capability in router priority: '{name}'"))
            })?;
            if !order.contains(&capability) {
                order.push(capability);
            }
        }
        if !order.contains(&Capability::Chat) {
            order.push(Capability::Chat);
        }
        Ok(Self { order })
    }

    fn pick(&self, triggered: &[Capability]) -> Capability {
        self.order
            .iter()
            .copied()
            .find(|c| triggered.contains(c))
            .unwrap_or(Capability::Chat)
    }
}

/// Target schema for structured extraction: a registry name or an ad-hoc
/// schema object.
#[derive(Debug, Clone)]
pub enum SchemaChoice {
    Named(String),
    Inline(Value),
}

/// An incoming request before classification.
#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    pub prompt: String,
    pub history: Vec<Turn>,
    pub use_rag: bool,
    pub attachments: Vec<Attachment>,
    pub schema: Option<SchemaChoice>,
    pub urls: Vec<String>,
    pub stores: Vec<String>,
    pub execute_code: bool,
}

impl RequestSpec {
    pub fn chat(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// The result of executing one capability path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    /// Plain or RAG-grounded answer with the sources that grounded it.
    Text {
        answer: String,
        sources: Vec<SourceRef>,
    },
    /// Schema-constrained extraction result.
    Structured {
        data: Value,
        schema_type: Option<String>,
    },
    /// Code-execution transcript, decomposed by part kind.
    Code {
        text_parts: Vec<String>,
        code_parts: Vec<String>,
        output_parts: Vec<String>,
    },
    /// URL-grounded answer with per-URL retrieval status.
    Urls {
        answer: String,
        url_metadata: Vec<UrlMetadata>,
    },
    /// Store-grounded answer with citations.
    FileSearch {
        answer: String,
        citations: Vec<SourceRef>,
    },
}

/// A prepared PDF ready for inline attachment, cached by content
/// fingerprint so repeated requests over the same bytes skip the encode.
struct PreparedPdf {
    mime_type: String,
    data: String,
    size_mb: f64,
}

pub struct Router {
    backend: Arc<dyn GenerativeBackend>,
    retriever: Arc<Retriever>,
    policy: RoutePolicy,
    config: GenerationConfig,
    pdf_cache: ResponseCache<PreparedPdf>,
}

impl Router {
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        retriever: Arc<Retriever>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            retriever,
            policy: RoutePolicy::from_config(&config.router)?,
            config: config.generation.clone(),
            pdf_cache: ResponseCache::new(
                Duration::from_secs(config.cache.ttl_secs),
                config.cache.capacity,
            ),
        })
    }

    /// Classify a request into its execution path without executing it.
    pub fn classify(&self, spec: &RequestSpec) -> Result<Capability> {
        let mut triggered = Vec::new();
        if spec.schema.is_some() {
            triggered.push(Capability::StructuredExtraction);
        }
        if spec
            .attachments
            .iter()
            .any(|a| a.mime_type == "application/pdf")
        {
            triggered.push(Capability::PdfAnalysis);
        }
        if !spec.stores.is_empty() {
            triggered.push(Capability::FileSearch);
        }
        if spec.execute_code {
            triggered.push(Capability::CodeExecution);
        }
        if !spec.urls.is_empty() {
            triggered.push(Capability::UrlAnalysis);
        }

        // Mutually exclusive combinations are reported, never guessed.
        if triggered.contains(&Capability::StructuredExtraction) {
            if spec.execute_code {
                return Err(EngineError::conflict(
                    "a target schema cannot be combined with code execution",
                ));
            }
            if !spec.stores.is_empty() {
                return Err(EngineError::conflict(
                    "a target schema cannot be combined with file-search stores",
                ));
            }
        }

        Ok(self.policy.pick(&triggered))
    }

    /// Classify and execute a request end to end.
    pub async fn execute(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let capability = self.classify(&spec)?;
        debug!(capability = capability.label(), "dispatching request");

        match capability {
            Capability::Chat => self.run_chat(spec).await,
            Capability::PdfAnalysis => self.run_pdf(spec).await,
            Capability::StructuredExtraction => self.run_structured(spec).await,
            Capability::CodeExecution => self.run_code(spec).await,
            Capability::UrlAnalysis => self.run_urls(spec).await,
            Capability::FileSearch => self.run_file_search(spec).await,
        }
    }

    async fn run_chat(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let (prompt, sources) = if spec.use_rag {
            let context = self.retriever.retrieve(&spec.prompt).await?;
            if context.is_empty() {
                // Degrade to an un-grounded answer.
                (spec.prompt.clone(), Vec::new())
            } else {
                let sources = context
                    .chunks
                    .iter()
                    .map(|c| SourceRef {
                        name: c.document_id.clone(),
                        content: c.text.clone(),
                    })
                    .collect();
                let prompt = format!(
                    "Answer using the sources below. If they are not sufficient, say so.\n\n{}Question: {}",
                    context.render(),
                    spec.prompt
                );
                (prompt, sources)
            }
        } else {
            (spec.prompt.clone(), Vec::new())
        };

        let mut turns = spec.history;
        turns.push(Turn::user_text(prompt));
        let request = ModelRequest::new(turns, &self.config);
        let response = self.call_with_retries(&request).await?;

        Ok(CapabilityOutcome::Text {
            answer: response.text(),
            sources,
        })
    }

    async fn run_pdf(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let attachment = spec
            .attachments
            .into_iter()
            .find(|a| a.mime_type == "application/pdf")
            .ok_or_else(|| EngineError::data("no PDF attachment in request"))?;

        let key = fingerprint(&attachment.data, &self.config.model);
        let prepared = self
            .pdf_cache
            .get_or_compute(&key, || async {
                Ok(PreparedPdf {
                    mime_type: attachment.mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&attachment.data),
                    size_mb: attachment.size_mb(),
                })
            })
            .await?;
        debug!(size_mb = prepared.size_mb, "PDF prepared for inline analysis");

        let prompt = if spec.prompt.is_empty() {
            "Analyze this document and summarize its contents.".to_string()
        } else {
            spec.prompt
        };
        let parts = vec![
            RequestPart::InlineData {
                mime_type: prepared.mime_type.clone(),
                data: prepared.data.clone(),
            },
            RequestPart::Text(prompt),
        ];

        let mut request = ModelRequest::new(vec![Turn::user(parts)], &self.config);
        let schema = match spec.schema {
            Some(choice) => Some(resolve_schema(&choice)?),
            None => None,
        };
        if let Some((schema, schema_type)) = &schema {
            request = request.with_schema(schema.clone());
            let response = self.call_with_retries(&request).await?;
            let data: Value = serde_json::from_str(&response.text())?;
            schemas::validate_required(schema, &data)?;
            return Ok(CapabilityOutcome::Structured {
                data,
                schema_type: schema_type.clone(),
            });
        }

        let response = self.call_with_retries(&request).await?;
        Ok(CapabilityOutcome::Text {
            answer: response.text(),
            sources: Vec::new(),
        })
    }

    async fn run_structured(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let choice = spec
            .schema
            .ok_or_else(|| EngineError::data("structured extraction requires a schema"))?;
        let (schema, schema_type) = resolve_schema(&choice)?;

        // Supplementary URLs ride along as context lines; the tool-based
        // URL path is exclusive with schema-constrained output.
        let mut prompt = spec.prompt;
        if !spec.urls.is_empty() {
            prompt.push_str("\n\nSources:\n");
            for url in &spec.urls {
                prompt.push_str(url);
                prompt.push('\n');
            }
        }

        let request =
            ModelRequest::new(vec![Turn::user_text(prompt)], &self.config).with_schema(schema.clone());
        let response = self.call_with_retries(&request).await?;

        let data: Value = serde_json::from_str(&response.text())?;
        schemas::validate_required(&schema, &data)?;
        Ok(CapabilityOutcome::Structured { data, schema_type })
    }

    async fn run_code(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let mut turns = spec.history;
        turns.push(Turn::user_text(spec.prompt));

        let mut response = ModelResponse::default();
        for iteration in 0..self.config.max_code_iterations.max(1) {
            let request = ModelRequest::new(turns.clone(), &self.config)
                .with_tool(ToolSpec::CodeExecution);
            response = self.call_with_retries(&request).await?;

            let failure = response.parts.iter().find_map(|part| match part {
                ResponsePart::CodeResult { ok: false, output } => Some(output.clone()),
                _ => None,
            });
            match failure {
                Some(output) if iteration + 1 < self.config.max_code_iterations => {
                    debug!(iteration, "code execution failed, requesting a fix");
                    turns.push(Turn::model_text(response.text()));
                    turns.push(Turn::user_text(format!(
                        "The code failed with:\n{output}\nFix the code and run it again."
                    )));
                }
                _ => break,
            }
        }

        let mut text_parts = Vec::new();
        let mut code_parts = Vec::new();
        let mut output_parts = Vec::new();
        for part in response.parts {
            match part {
                ResponsePart::Text(text) => text_parts.push(text),
                ResponsePart::ExecutableCode { code, .. } => code_parts.push(code),
                ResponsePart::CodeResult { output, .. } => output_parts.push(output),
            }
        }
        Ok(CapabilityOutcome::Code {
            text_parts,
            code_parts,
            output_parts,
        })
    }

    async fn run_urls(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        if spec.urls.len() > self.config.max_urls {
            return Err(EngineError::data(format!(
                "too many URLs: {} exceeds the limit of {}",
                spec.urls.len(),
                self.config.max_urls
            )));
        }

        let mut prompt = spec.prompt;
        prompt.push_str("\n\nURLs:\n");
        for url in &spec.urls {
            prompt.push_str(url);
            prompt.push('\n');
        }

        let request =
            ModelRequest::new(vec![Turn::user_text(prompt)], &self.config).with_tool(ToolSpec::UrlContext);
        let response = self.call_with_retries(&request).await?;

        Ok(CapabilityOutcome::Urls {
            answer: response.text(),
            url_metadata: response.url_metadata,
        })
    }

    async fn run_file_search(&self, spec: RequestSpec) -> Result<CapabilityOutcome> {
        let context = self.retriever.retrieve_stores(&spec.prompt, &spec.stores).await?;

        let citations: Vec<SourceRef> = context
            .chunks
            .iter()
            .map(|c| SourceRef {
                name: c.document_id.clone(),
                content: c.text.clone(),
            })
            .collect();

        let prompt = if context.is_empty() {
            format!(
                "No stored documents matched the question. Say that the stores contain nothing relevant.\n\nQuestion: {}",
                spec.prompt
            )
        } else {
            format!(
                "Answer strictly from the stored documents below and cite which document each claim comes from.\n\n{}Question: {}",
                context.render(),
                spec.prompt
            )
        };

        let request = ModelRequest::new(vec![Turn::user_text(prompt)], &self.config);
        let response = self.call_with_retries(&request).await?;

        Ok(CapabilityOutcome::FileSearch {
            answer: response.text(),
            citations,
        })
    }

    /// Retry transient backend failures with exponential backoff between
    /// the configured bounds.
    pub async fn call_with_retries(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let mut delay = Duration::from_millis(self.config.backoff_initial_ms);
        let max_delay = Duration::from_millis(self.config.backoff_max_ms);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
            match self.backend.generate(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "transient backend failure, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::upstream_transient("generation failed after retries")))
    }
}

fn resolve_schema(choice: &SchemaChoice) -> Result<(Value, Option<String>)> {
    match choice {
        SchemaChoice::Named(name) => Ok((schemas::resolve(name)?, Some(name.clone()))),
        SchemaChoice::Inline(schema) => Ok((schema.clone(), None)),
    }
}
