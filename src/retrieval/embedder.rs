//! Text embedders.
//!
//! The index only needs vectors of a fixed dimension that compare by cosine
//! similarity. Two implementations:
//! - [`HttpEmbedder`]: an OpenAI-compatible `/embeddings` endpoint. Per-token
//!   output (`number[][]`) is mean-pooled.
//! - [`HashingEmbedder`]: deterministic feature hashing over words, offline.
//!
//! Both return L2-normalized vectors, so cosine similarity is a dot product.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::errors::RetrievalError;

/// Request timeout for the embeddings endpoint.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed each text. The result has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// Stable name of the embedding space, used to key cached vectors.
    fn cache_id(&self) -> String;
}

// ─── HttpEmbedder ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEmbeddingItem {
    index: usize,
    embedding: serde_json::Value, // number[] or number[][] (per-token)
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<RawEmbeddingItem>,
}

pub struct HttpEmbedder {
    http: HttpClient,
    endpoint: String,
}

impl HttpEmbedder {
    /// `endpoint` is the API base, e.g. `http://localhost:8080/v1`.
    pub fn new(endpoint: &str) -> Result<Self, RetrievalError> {
        let http = HttpClient::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| RetrievalError::EmbeddingFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "input": texts }))
            .send()
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed {
                reason: format!("embedding request to {url}: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RetrievalError::HttpError { status, body });
        }

        let result: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::EmbeddingFailed {
                    reason: format!("failed to parse embedding response: {e}"),
                })?;

        if result.data.len() != texts.len() {
            return Err(RetrievalError::EmptyResponse { count: texts.len() });
        }

        // Order by index so output matches input
        let mut items = result.data;
        items.sort_by_key(|item| item.index);

        items
            .into_iter()
            .map(|item| mean_pool_embedding(&item.embedding).map(l2_normalize))
            .collect()
    }

    fn cache_id(&self) -> String {
        format!("http:{}", self.endpoint)
    }
}

/// Mean-pool per-token embeddings into a single vector.
///
/// A 1D array is returned as-is; a 2D array is averaged over its rows.
pub(crate) fn mean_pool_embedding(
    embedding: &serde_json::Value,
) -> Result<Vec<f32>, RetrievalError> {
    let serde_json::Value::Array(arr) = embedding else {
        return Err(unexpected_format());
    };
    let Some(first) = arr.first() else {
        return Ok(Vec::new());
    };

    if first.is_number() {
        return Ok(arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect());
    }
    if !first.is_array() {
        return Err(unexpected_format());
    }

    let rows: Vec<Vec<f32>> = arr
        .iter()
        .filter_map(|row| {
            row.as_array()
                .map(|r| r.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
        })
        .collect();

    let n_dim = rows.first().map(|r: &Vec<f32>| r.len()).unwrap_or(0);
    let mut pooled = vec![0.0_f32; n_dim];
    for row in &rows {
        if row.len() != n_dim {
            return Err(RetrievalError::DimensionMismatch {
                expected: n_dim,
                actual: row.len(),
            });
        }
        for (d, val) in row.iter().enumerate() {
            pooled[d] += val;
        }
    }
    for val in &mut pooled {
        *val /= rows.len() as f32;
    }
    Ok(pooled)
}

fn unexpected_format() -> RetrievalError {
    RetrievalError::EmbeddingFailed {
        reason: "unexpected embedding format (expected number[] or number[][])".to_string(),
    }
}

// ─── HashingEmbedder ────────────────────────────────────────────────────────

/// Bag-of-words feature hashing: each lowercase word adds ±1 to the bucket
/// its SHA-256 digest selects.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0_f32; self.dim];
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase());

        for word in words {
            let digest = Sha256::digest(word.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dim as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }

        l2_normalize(vec)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn cache_id(&self) -> String {
        format!("hashing-sha256:{}", self.dim)
    }
}

// ─── Vector Helpers ─────────────────────────────────────────────────────────

/// L2-normalize a vector. A zero vector is returned unchanged.
pub(crate) fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.into_iter().map(|v| v / norm).collect()
    } else {
        vec
    }
}

/// Cosine similarity of two L2-normalized vectors (their dot product).
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
