//! Generative backend abstraction and HTTP implementation.
//!
//! [`GenerativeBackend`] is the single seam through which every capability
//! path reaches the model. Requests carry conversation turns, optional
//! inline binary parts (PDFs), an optional response schema for structured
//! output, and tool declarations (server-side code execution, URL
//! context). Responses decompose into typed parts so the code-execution
//! path can see generated code and its runtime output separately.
//!
//! [`HttpBackend`] speaks a Gemini-style REST API: unary
//! `models/{model}:generateContent` and SSE
//! `models/{model}:streamGenerateContent?alt=sse`. It performs no retries
//! itself; transient failures are classified and the router decides.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{EngineError, Result};

/// One piece of a request turn.
#[derive(Debug, Clone)]
pub enum RequestPart {
    Text(String),
    /// Base64-encoded binary content, e.g. a PDF.
    InlineData { mime_type: String, data: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<RequestPart>,
}

impl Turn {
    pub fn user(parts: Vec<RequestPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![RequestPart::Text(text.into())])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![RequestPart::Text(text.into())],
        }
    }
}

/// Server-side tools a request may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSpec {
    CodeExecution,
    UrlContext,
}

/// A fully assembled model request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub turns: Vec<Turn>,
    /// JSON schema constraining the response to structured output.
    pub response_schema: Option<Value>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl ModelRequest {
    pub fn new(turns: Vec<Turn>, config: &GenerationConfig) -> Self {
        Self {
            turns,
            response_schema: None,
            tools: Vec::new(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }
}

/// One piece of a model response.
#[derive(Debug, Clone)]
pub enum ResponsePart {
    Text(String),
    /// Code the model chose to run via the code-execution tool.
    ExecutableCode { language: String, code: String },
    /// The runtime outcome of an executed block.
    CodeResult { ok: bool, output: String },
}

/// URL retrieval status reported by the URL-context tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UrlMetadata {
    pub url: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    pub url_metadata: Vec<UrlMetadata>,
}

impl ModelResponse {
    /// All text parts concatenated.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ResponsePart::Text(t) = part {
                out.push_str(t);
            }
        }
        out
    }
}

/// A streamed piece of generated text.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
}

/// Model access seam. One unary call and one streaming call; everything
/// the router does is built from these two.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Start a streaming generation. Fragments arrive on the returned
    /// channel in order; a mid-stream failure arrives as one final `Err`.
    async fn generate_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<mpsc::Receiver<Result<Fragment>>>;
}

// ============ HTTP backend ============

pub struct HttpBackend {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// # Errors
    ///
    /// Fails if the API key environment variable named by the config is
    /// not set.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EngineError::data(format!("{} environment variable not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }

    fn endpoint(&self, method: &str, query: &str) -> String {
        format!(
            "{}/models/{}:{method}?key={}{query}",
            self.base_url, self.model, self.api_key
        )
    }
}

#[async_trait]
impl GenerativeBackend for HttpBackend {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = build_request_body(request);
        debug!(model = %self.model, turns = request.turns.len(), "generate");

        let response = self
            .client
            .post(self.endpoint("generateContent", ""))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body_text));
        }

        let json: Value = response.json().await?;
        parse_response(&json)
    }

    async fn generate_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<mpsc::Receiver<Result<Fragment>>> {
        let body = build_request_body(request);
        let response = self
            .client
            .post(self.endpoint("streamGenerateContent", "&alt=sse"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body_text));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited; hold back the last
                // partial line until more bytes arrive.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    if let Some(text) = parse_sse_line(&line) {
                        if !text.is_empty()
                            && tx.send(Ok(Fragment { text })).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    let detail = format!("generative API error {status}: {body}");
    if status.as_u16() == 429 || status.is_server_error() {
        EngineError::upstream_transient(detail)
    } else {
        EngineError::upstream(detail)
    }
}

/// Serialize a [`ModelRequest`] into the wire format.
pub fn build_request_body(request: &ModelRequest) -> Value {
    let contents: Vec<Value> = request
        .turns
        .iter()
        .map(|turn| {
            let parts: Vec<Value> = turn
                .parts
                .iter()
                .map(|part| match part {
                    RequestPart::Text(text) => json!({ "text": text }),
                    RequestPart::InlineData { mime_type, data } => json!({
                        "inline_data": { "mime_type": mime_type, "data": data }
                    }),
                })
                .collect();
            json!({ "role": turn.role.as_str(), "parts": parts })
        })
        .collect();

    let mut generation_config = json!({
        "temperature": request.temperature,
        "maxOutputTokens": request.max_output_tokens,
    });
    if let Some(schema) = &request.response_schema {
        generation_config["responseMimeType"] = json!("application/json");
        generation_config["responseSchema"] = schema.clone();
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| match tool {
                ToolSpec::CodeExecution => json!({ "code_execution": {} }),
                ToolSpec::UrlContext => json!({ "url_context": {} }),
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

/// Decompose a unary API response into typed parts.
pub fn parse_response(json: &Value) -> Result<ModelResponse> {
    let candidate = json
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| EngineError::upstream("response has no candidates"))?;

    let mut response = ModelResponse::default();

    if let Some(parts) = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                response.parts.push(ResponsePart::Text(text.to_string()));
            } else if let Some(code) = part.get("executableCode") {
                response.parts.push(ResponsePart::ExecutableCode {
                    language: code
                        .get("language")
                        .and_then(|l| l.as_str())
                        .unwrap_or("PYTHON")
                        .to_string(),
                    code: code
                        .get("code")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            } else if let Some(result) = part.get("codeExecutionResult") {
                let outcome = result
                    .get("outcome")
                    .and_then(|o| o.as_str())
                    .unwrap_or_default();
                response.parts.push(ResponsePart::CodeResult {
                    ok: outcome == "OUTCOME_OK",
                    output: result
                        .get("output")
                        .and_then(|o| o.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
    }

    if let Some(urls) = candidate
        .pointer("/urlContextMetadata/urlMetadata")
        .and_then(|u| u.as_array())
    {
        for entry in urls {
            response.url_metadata.push(UrlMetadata {
                url: entry
                    .get("retrievedUrl")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string(),
                status: entry
                    .get("urlRetrievalStatus")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    Ok(response)
}

/// Extract the text delta from one SSE line, if it carries one.
fn parse_sse_line(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data: ")?;
    if payload == "[DONE]" {
        return None;
    }
    let json: Value = serde_json::from_str(payload).ok()?;
    let parts = json.pointer("/candidates/0/content/parts")?.as_array()?;
    let mut text = String::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
            text.push_str(t);
        }
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GenerationConfig {
        GenerationConfig::default()
    }

    #[test]
    fn request_body_basic_chat() {
        let request = ModelRequest::new(vec![Turn::user_text("hello")], &config());
        let body = build_request_body(&request);
        assert_eq!(
            body.pointer("/contents/0/parts/0/text").unwrap(),
            "hello"
        );
        assert_eq!(body.pointer("/contents/0/role").unwrap(), "user");
        assert!(body.get("tools").is_none());
        assert!(body.pointer("/generationConfig/responseSchema").is_none());
    }

    #[test]
    fn request_body_schema_sets_json_mime() {
        let schema = json!({ "type": "object", "properties": {} });
        let request =
            ModelRequest::new(vec![Turn::user_text("extract")], &config()).with_schema(schema);
        let body = build_request_body(&request);
        assert_eq!(
            body.pointer("/generationConfig/responseMimeType").unwrap(),
            "application/json"
        );
        assert!(body.pointer("/generationConfig/responseSchema").is_some());
    }

    #[test]
    fn request_body_declares_tools() {
        let request = ModelRequest::new(vec![Turn::user_text("run it")], &config())
            .with_tool(ToolSpec::CodeExecution)
            .with_tool(ToolSpec::UrlContext);
        let body = build_request_body(&request);
        let tools = body.get("tools").unwrap().as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools[0].get("code_execution").is_some());
        assert!(tools[1].get("url_context").is_some());
    }

    #[test]
    fn request_body_inline_data() {
        let request = ModelRequest::new(
            vec![Turn::user(vec![
                RequestPart::InlineData {
                    mime_type: "application/pdf".to_string(),
                    data: "QkFTRTY0".to_string(),
                },
                RequestPart::Text("summarize".to_string()),
            ])],
            &config(),
        );
        let body = build_request_body(&request);
        assert_eq!(
            body.pointer("/contents/0/parts/0/inline_data/mime_type")
                .unwrap(),
            "application/pdf"
        );
        assert_eq!(
            body.pointer("/contents/0/parts/1/text").unwrap(),
            "summarize"
        );
    }

    #[test]
    fn parse_mixed_response_parts() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Computing the answer." },
                    { "executableCode": { "language": "PYTHON", "code": "print(6*7)" } },
                    { "codeExecutionResult": { "outcome": "OUTCOME_OK", "output": "42\n" } },
                    { "text": "The answer is 42." }
                ]}
            }]
        });
        let response = parse_response(&json).unwrap();
        assert_eq!(response.parts.len(), 4);
        assert_eq!(response.text(), "Computing the answer.The answer is 42.");
        assert!(matches!(
            &response.parts[1],
            ResponsePart::ExecutableCode { code, .. } if code == "print(6*7)"
        ));
        assert!(matches!(
            &response.parts[2],
            ResponsePart::CodeResult { ok: true, output } if output == "42\n"
        ));
    }

    #[test]
    fn parse_failed_code_result() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [
                    { "codeExecutionResult": { "outcome": "OUTCOME_FAILED", "output": "NameError" } }
                ]}
            }]
        });
        let response = parse_response(&json).unwrap();
        assert!(matches!(
            &response.parts[0],
            ResponsePart::CodeResult { ok: false, .. }
        ));
    }

    #[test]
    fn parse_url_metadata() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "summary" }] },
                "urlContextMetadata": { "urlMetadata": [
                    { "retrievedUrl": "https://example.com", "urlRetrievalStatus": "URL_RETRIEVAL_STATUS_SUCCESS" }
                ]}
            }]
        });
        let response = parse_response(&json).unwrap();
        assert_eq!(response.url_metadata.len(), 1);
        assert_eq!(response.url_metadata[0].url, "https://example.com");
    }

    #[test]
    fn parse_rejects_empty_candidates() {
        assert!(parse_response(&json!({ "candidates": [] })).is_err());
        assert!(parse_response(&json!({})).is_err());
    }

    #[test]
    fn sse_line_extraction() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"hel"}]}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), "hel");
        assert!(parse_sse_line("event: ping").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line("").is_none());
    }
}
