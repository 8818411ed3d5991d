//! Text embedding providers
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::check_status;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed already-normalized text with the named model
    async fn embed(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint
pub struct HttpEmbeddingProvider {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: model_id,
            input: vec![text],
        };
        let mut builder = self.http_client.post(self.embeddings_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        let response = check_status("embeddings", response).await?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding response contained no vectors"))?;
        if embedding.is_empty() {
            anyhow::bail!("Embedding response contained an empty vector");
        }
        debug!("Generated embedding (dim={})", embedding.len());
        Ok(embedding)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

lazy_static! {
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
}

/// Offline feature-hashing embedder.
///
/// Every word token is hashed into one of `dimensions` buckets and the
/// resulting count vector is L2-normalized. Texts sharing vocabulary score
/// high under cosine similarity. Fully deterministic, no model download.
pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embed_sync(&self, text: &str, model_id: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in TOKEN_REGEX.find_iter(text) {
            let mut hasher = blake3::Hasher::new();
            hasher.update(model_id.as_bytes());
            hasher.update(&[0]);
            hasher.update(token.as_str().to_lowercase().as_bytes());
            let digest = hasher.finalize();
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest.as_bytes()[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>> {
        let vector = self.embed_sync(text, model_id);
        if vector.iter().all(|v| *v == 0.0) {
            anyhow::bail!("text has no embeddable tokens");
        }
        Ok(vector)
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}
