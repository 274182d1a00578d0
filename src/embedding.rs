//! Embedding client and vector utilities.
//!
//! [`EmbeddingClient`] talks to an OpenAI-style `/embeddings` endpoint
//! with a fixed model and output dimensionality. Queries and passages
//! use distinct task hints but share one vector space, so query vectors
//! stay comparable to stored chunk vectors.
//!
//! The plain batch path does not retry: ingestion treats a failed batch
//! as a failed document. [`EmbeddingClient::embed_passages_with_retry`]
//! is the bulk-backfill variant with bounded linear backoff.
//!
//! Vector helpers for SQLite BLOB storage:
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 encoding
//! - [`cosine_similarity`] — similarity between two embedding vectors

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Task hint for query-time embedding requests.
const TASK_QUERY: &str = "retrieval.query";
/// Task hint for ingestion-time (passage) embedding requests.
const TASK_PASSAGE: &str = "retrieval.passage";

/// Client for a remote embedding provider. Explicitly constructed from
/// configuration; never reads process-global state after construction.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    sub_batch_size: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
            sub_batch_size: config.sub_batch_size,
            max_retries: config.max_retries.max(1),
        })
    }

    /// Configured output dimensionality. Must match the deployed chunk
    /// store exactly.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a single search query.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            bail!("empty text for embedding");
        }

        let mut vectors = self.request(TASK_QUERY, &[input.to_string()]).await?;
        vectors
            .pop()
            .context("embedding response contained no vectors")
    }

    /// Embed a batch of passages, preserving input order.
    ///
    /// Blank inputs are filtered out before sending; an entirely blank
    /// batch fails fast without touching the provider. Large batches are
    /// split into fixed-size sub-batches to keep individual requests
    /// under the provider timeout, and results are re-joined in input
    /// order.
    pub async fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let filtered = filter_blank(texts);
        if filtered.is_empty() {
            bail!("no valid texts for embedding");
        }

        let mut vectors = Vec::with_capacity(filtered.len());
        for batch in filtered.chunks(self.sub_batch_size) {
            vectors.extend(self.request(TASK_PASSAGE, batch).await?);
        }
        Ok(vectors)
    }

    /// Backfill variant: each sub-batch is attempted up to
    /// `max_retries` times with linear backoff (2s x attempt number).
    pub async fn embed_passages_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let filtered = filter_blank(texts);
        if filtered.is_empty() {
            bail!("no valid texts for embedding");
        }

        let mut vectors = Vec::with_capacity(filtered.len());
        for batch in filtered.chunks(self.sub_batch_size) {
            vectors.extend(self.request_with_retry(batch).await?);
        }
        Ok(vectors)
    }

    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 1..=self.max_retries {
            match self.request(TASK_PASSAGE, texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    tracing::warn!(attempt, max = self.max_retries, error = %e, "embedding batch failed");
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries"))
            .context("embedding failed after retries"))
    }

    async fn request(&self, task: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "task": task,
            "dimensions": self.dims,
            "input": texts,
        });

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("embedding request failed with {}: {}", status, body_text);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("invalid embedding response")?;

        if parsed.data.len() != texts.len() {
            bail!(
                "embedding response count mismatch: sent {}, received {}",
                texts.len(),
                parsed.data.len()
            );
        }

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            if vector.len() != self.dims {
                bail!(
                    "embedding dimensionality mismatch: provider returned {}, deployment expects {}",
                    vector.len(),
                    self.dims
                );
            }
        }

        Ok(vectors)
    }
}

fn filter_blank(texts: &[String]) -> Vec<String> {
    texts
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

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

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Equivalent to `1 - cosine_distance`; returns `0.0` for empty or
/// mismatched-length vectors.
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
