use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            lookahead: default_lookahead(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_lookahead() -> usize {
    100
}
fn default_min_chunk_chars() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    /// Falls back to the JINA_API_KEY environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dims: default_dims(),
            sub_batch_size: default_sub_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(key.clone()),
            _ => std::env::var("JINA_API_KEY")
                .context("embedding.api_key not set and JINA_API_KEY not in environment"),
        }
    }
}

fn default_embedding_base_url() -> String {
    "https://api.jina.ai/v1".to_string()
}
fn default_embedding_model() -> String {
    "jina-embeddings-v3".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_sub_batch_size() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    /// Falls back to the OPENROUTER_API_KEY environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            api_key: None,
            model: default_completion_model(),
            fallback_models: default_fallback_models(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CompletionConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(key.clone()),
            _ => std::env::var("OPENROUTER_API_KEY")
                .context("completion.api_key not set and OPENROUTER_API_KEY not in environment"),
        }
    }
}

fn default_completion_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_completion_model() -> String {
    "google/gemma-3-27b-it:free".to_string()
}
fn default_fallback_models() -> Vec<String> {
    vec![
        "google/gemma-3-27b-it:free".to_string(),
        "deepseek/deepseek-r1-0528:free".to_string(),
        "meta-llama/llama-3.3-70b-instruct:free".to_string(),
        "nvidia/llama-3.1-nemotron-70b-instruct:free".to_string(),
        "openai/gpt-oss-120b:free".to_string(),
    ]
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_source_excerpt_chars")]
    pub source_excerpt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
            history_limit: default_history_limit(),
            history_window: default_history_window(),
            source_excerpt_chars: default_source_excerpt_chars(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_top_k() -> usize {
    5
}
fn default_history_limit() -> i64 {
    10
}
fn default_history_window() -> usize {
    8
}
fn default_source_excerpt_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }
    if config.chunking.min_chunk_chars >= config.chunking.chunk_size {
        anyhow::bail!("chunking.min_chunk_chars must be smaller than chunking.chunk_size");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.sub_batch_size == 0 {
        anyhow::bail!("embedding.sub_batch_size must be > 0");
    }

    if config.completion.model.is_empty() {
        anyhow::bail!("completion.model must not be empty");
    }
    if !(0.0..=2.0).contains(&config.completion.temperature) {
        anyhow::bail!("completion.temperature must be in [0.0, 2.0]");
    }

    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.history_window as i64 > config.retrieval.history_limit {
        anyhow::bail!("retrieval.history_window must not exceed retrieval.history_limit");
    }

    Ok(config)
}
