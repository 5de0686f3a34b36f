//! TOML configuration for the engine.
//!
//! Every tunable recognized at the core boundary lives here: chunk target
//! size and overlap, embedding batch size, retrieval `k` and token budget,
//! cache TTL, retry attempt count and backoff bounds, router priority.
//! Nothing is hardcoded in the pipeline itself.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Index backend: `"sqlite"` (persistent) or `"memory"` (ephemeral).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Connection pool size for the sqlite backend.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/ragpipe.sqlite")
}
fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in bytes.
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    /// Overlap window between adjacent chunks, in bytes.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_target_size() -> usize {
    3000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Provider: `"hash"` (local, deterministic) or `"openai"` (remote).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Number of texts per embedding call during ingestion.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-item input length limit; oversized items fail the batch.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Environment variable holding the API key for remote providers.
    #[serde(default = "default_embed_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_timeout_secs(),
            max_input_chars: default_max_input_chars(),
            api_key_env: default_embed_key_env(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_embed_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks to pack into a query context.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Candidate over-fetch multiplier, to leave room for deduplication.
    #[serde(default = "default_overfetch")]
    pub overfetch_factor: usize,
    /// Context budget in approximate tokens (4 chars per token).
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            overfetch_factor: default_overfetch(),
            token_budget: default_token_budget(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_overfetch() -> usize {
    4
}
fn default_token_budget() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Base URL of the generative API.
    #[serde(default = "default_gen_base_url")]
    pub base_url: String,
    #[serde(default = "default_gen_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_gen_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry attempts for transient backend errors.
    #[serde(default = "default_gen_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Self-correction rounds for the code-execution path.
    #[serde(default = "default_code_iterations")]
    pub max_code_iterations: u32,
    /// Maximum URLs accepted by the URL-analysis path.
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_gen_base_url(),
            model: default_gen_model(),
            api_key_env: default_gen_key_env(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_gen_timeout_secs(),
            max_retries: default_gen_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_code_iterations: default_code_iterations(),
            max_urls: default_max_urls(),
        }
    }
}

fn default_gen_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gen_model() -> String {
    "gemini-2.0-flash-exp".to_string()
}
fn default_gen_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_output_tokens() -> u32 {
    2048
}
fn default_gen_timeout_secs() -> u64 {
    60
}
fn default_gen_retries() -> u32 {
    3
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8000
}
fn default_code_iterations() -> u32 {
    3
}
fn default_max_urls() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Time-to-live for cached artifacts, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of ready entries; least-recently-used are evicted.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Capability priority, highest first, used when one request triggers
    /// several paths. Names: `structured`, `pdf`, `file_search`, `code`,
    /// `url`, `chat`.
    #[serde(default = "default_priority")]
    pub priority: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
        }
    }
}

fn default_priority() -> Vec<String> {
    ["structured", "pdf", "file_search", "code", "url", "chat"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.db.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!("db.backend must be sqlite or memory, got '{}'", other),
    }
    if config.db.pool_size == 0 {
        anyhow::bail!("db.pool_size must be >= 1");
    }

    if config.chunking.target_size == 0 {
        anyhow::bail!("chunking.target_size must be > 0");
    }
    if config.chunking.overlap == 0 || config.chunking.overlap >= config.chunking.target_size {
        anyhow::bail!("chunking.overlap must satisfy 0 < overlap < target_size");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be set when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        anyhow::bail!("retrieval.overfetch_factor must be >= 1");
    }

    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.backoff_initial_ms == 0
        || config.generation.backoff_max_ms < config.generation.backoff_initial_ms
    {
        anyhow::bail!("generation backoff bounds must satisfy 0 < initial <= max");
    }

    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be >= 1");
    }

    for name in &config.router.priority {
        match name.as_str() {
            "structured" | "pdf" | "file_search" | "code" | "url" | "chat" => {}
            other => anyhow::bail!("router.priority contains unknown capability '{}'", other),
        }
    }

    Ok(())
}
