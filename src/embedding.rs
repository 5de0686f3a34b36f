//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two backends:
//! - **[`HashProvider`]** — local, deterministic feature hashing. No network
//!   calls; suitable for tests and fully offline deployments.
//! - **[`OpenAiProvider`]** — remote HTTP embeddings API with batching and
//!   exponential-backoff retry.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 encoding for
//!   SQLite BLOB storage
//!
//! # Retry strategy (remote provider)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// An embedding backend mapping text to fixed-dimension vectors.
///
/// Implementations must be deterministic for identical input and
/// configuration so ingestion is reproducible.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"` or `"hash"`).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, preserving input order.
    ///
    /// Atomic: if any item fails (e.g. exceeds the input length limit) the
    /// whole batch fails and no vectors are returned. Callers wanting
    /// partial results use [`embed_best_effort`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let vectors = provider.embed_batch(&[text.to_string()]).await?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::upstream("empty embedding response"))
}

/// Best-effort batch embedding: failed items are reported individually
/// alongside successes, in input order.
pub async fn embed_best_effort(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Vec<Result<Vec<f32>>> {
    let mut results = Vec::with_capacity(texts.len());
    for text in texts {
        results.push(embed_query(provider, text).await);
    }
    results
}

/// Instantiate the provider named in the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashProvider::new(config.dims, config.max_input_chars))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => Err(EngineError::data(format!(
            "unknown embedding provider: '{other}' (expected hash or openai)"
        ))),
    }
}

// ============ Hash Provider ============

/// Deterministic local embeddings via token feature hashing.
///
/// Each whitespace-delimited, lowercased token is hashed into a bucket with
/// a sign bit; the accumulated vector is L2-normalized. Identical text
/// always produces the identical vector, so the self-retrieval property of
/// the index holds exactly.
pub struct HashProvider {
    dims: usize,
    max_input_chars: usize,
}

impl HashProvider {
    pub fn new(dims: usize, max_input_chars: usize) -> Self {
        Self {
            dims,
            max_input_chars,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().unwrap()) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        for (i, text) in texts.iter().enumerate() {
            if text.len() > self.max_input_chars {
                return Err(EngineError::data(format!(
                    "batch item {i} exceeds embedding input limit ({} > {} chars)",
                    text.len(),
                    self.max_input_chars
                )));
            }
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI Provider ============

/// Remote embedding provider calling an OpenAI-compatible
/// `POST /v1/embeddings` endpoint.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    max_input_chars: usize,
    max_retries: u32,
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// Fails if `embedding.model` is not set or the API key environment
    /// variable named by the config is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EngineError::data("embedding.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EngineError::data(format!("{} environment variable not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            max_input_chars: config.max_input_chars,
            max_retries: config.max_retries,
            client,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Enforce the length limit up front so the batch fails atomically
        // before any network traffic.
        for (i, text) in texts.iter().enumerate() {
            if text.len() > self.max_input_chars {
                return Err(EngineError::data(format!(
                    "batch item {i} exceeds embedding input limit ({} > {} chars)",
                    text.len(),
                    self.max_input_chars
                )));
            }
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_embeddings_response(&json)?;
                        for v in &vectors {
                            if v.len() != self.dims {
                                return Err(EngineError::DimensionMismatch {
                                    expected: self.dims,
                                    got: v.len(),
                                });
                            }
                        }
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt, %status, "embedding API transient error, retrying");
                        last_err = Some(EngineError::upstream_transient(format!(
                            "embedding API error {status}: {body_text}"
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry.
                    return Err(EngineError::upstream(format!(
                        "embedding API error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::upstream_transient("embedding failed after retries")))
    }
}

/// Extract the `data[].embedding` arrays from an embeddings API response,
/// in input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EngineError::upstream("invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EngineError::upstream("invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two embedding vectors, in `[-1.0, 1.0]`.
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_provider() -> HashProvider {
        HashProvider::new(64, 8000)
    }

    #[tokio::test]
    async fn hash_provider_deterministic() {
        let p = hash_provider();
        let a = embed_query(&p, "the quick brown fox").await.unwrap();
        let b = embed_query(&p, "the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn hash_provider_normalized() {
        let p = hash_provider();
        let v = embed_query(&p, "alpha beta gamma delta").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_text_scores_higher() {
        let p = hash_provider();
        let query = embed_query(&p, "deployment runbook for kubernetes").await.unwrap();
        let near = embed_query(&p, "kubernetes deployment steps in the runbook")
            .await
            .unwrap();
        let far = embed_query(&p, "chocolate cake recipe with frosting")
            .await
            .unwrap();
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let p = hash_provider();
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let batch = p.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vec) in texts.iter().zip(batch.iter()) {
            assert_eq!(vec, &embed_query(&p, text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn oversized_item_fails_batch_atomically() {
        let p = HashProvider::new(16, 10);
        let texts = vec!["short".to_string(), "way too long for the limit".to_string()];
        let err = p.embed_batch(&texts).await.unwrap_err();
        assert_eq!(err.kind(), "data");
    }

    #[tokio::test]
    async fn best_effort_reports_per_item() {
        let p = HashProvider::new(16, 10);
        let texts = vec!["short".to_string(), "way too long for the limit".to_string()];
        let results = embed_best_effort(&p, &texts).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
