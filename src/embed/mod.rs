//! Embedding generation via the external embeddings API.
//!
//! [`Embedder`] is the seam: production uses [`HttpEmbedder`] against an
//! OpenAI-compatible `/embeddings` endpoint; tests use the deterministic
//! [`HashEmbedder`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::errors::{RagError, Result};
use crate::llm::RetryPolicy;

/// Default embedding batch cap.
pub const MAX_BATCH: usize = 128;

/// Default per-item token cap for the embedding model.
pub const MAX_ITEM_TOKENS: usize = 8192;

/// A batch of embeddings plus any pre-truncation warnings, which the
/// ingestion worker records in job metadata.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBatch {
    pub vectors: Vec<Vec<f32>>,
    pub warnings: Vec<String>,
}

/// Seam to the external embeddings model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Output length equals input length, order
    /// preserved. Batches above the provider cap are split transparently.
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddedBatch>;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;

    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let batch = self.embed_batch(&input).await?;
        batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbedFailure("empty embedding response".to_string()))
    }
}

/// HTTP embedder for an OpenAI-compatible embeddings API. Stateless and
/// safe to call concurrently.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    max_batch: usize,
    max_item_tokens: usize,
    bpe: CoreBPE,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, dimensions: usize) -> Result<Self> {
        let client = Client::builder().build().map_err(RagError::Http)?;
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| RagError::Config(format!("failed to load tokenizer: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimensions,
            max_batch: MAX_BATCH,
            max_item_tokens: MAX_ITEM_TOKENS,
            bpe,
            retry: RetryPolicy::new(),
        })
    }

    /// Override the provider batch cap and per-item token cap.
    pub fn with_limits(mut self, max_batch: usize, max_item_tokens: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self.max_item_tokens = max_item_tokens.max(1);
        self
    }

    /// Truncate items above the model's token cap, collecting a warning
    /// per truncated item.
    fn pre_truncate(&self, texts: &[String]) -> (Vec<String>, Vec<String>) {
        let mut prepared = Vec::with_capacity(texts.len());
        let mut warnings = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let tokens = self.bpe.encode_ordinary(text);
            if tokens.len() > self.max_item_tokens {
                let truncated = self
                    .bpe
                    .decode(tokens[..self.max_item_tokens].to_vec())
                    .unwrap_or_else(|_| text.chars().take(self.max_item_tokens * 4).collect());
                warn!(
                    item = i,
                    tokens = tokens.len(),
                    cap = self.max_item_tokens,
                    "embedding input truncated to model cap"
                );
                warnings.push(format!(
                    "item {} truncated from {} to {} tokens",
                    i,
                    tokens.len(),
                    self.max_item_tokens
                ));
                prepared.push(truncated);
            } else {
                prepared.push(text.clone());
            }
        }

        (prepared, warnings)
    }

    async fn embed_sub_batch(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsBody {
                model: &self.model,
                input,
            })
            .send()
            .await
            .map_err(RagError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::from_status(status.as_u16(), body));
        }

        let parsed: EmbeddingsResponse = response.json().await.map_err(RagError::Http)?;
        if parsed.data.len() != input.len() {
            return Err(RagError::EmbedFailure(format!(
                "expected {} vectors, got {}",
                input.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddedBatch> {
        if texts.is_empty() {
            return Ok(EmbeddedBatch::default());
        }

        let (prepared, warnings) = self.pre_truncate(texts);

        let mut vectors = Vec::with_capacity(prepared.len());
        for sub in prepared.chunks(self.max_batch) {
            let sub_vectors = self
                .retry
                .run(|| self.embed_sub_batch(sub))
                .await
                .map_err(|e| match e {
                    e if e.is_transient() => e,
                    RagError::PermanentUpstream { status, message } => RagError::EmbedFailure(
                        format!("embeddings call failed (status {}): {}", status, message),
                    ),
                    other => other,
                })?;
            vectors.extend(sub_vectors);
        }

        Ok(EmbeddedBatch { vectors, warnings })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic pseudo-embedder for tests: the same text always maps to
/// the same unit vector, and different texts almost surely differ.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddedBatch> {
        let vectors = texts
            .iter()
            .map(|text| {
                use std::collections::hash_map::DefaultHasher;
                use std::hash::{Hash, Hasher};

                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                let mut state = hasher.finish();

                let mut vector: Vec<f32> = (0..self.dimensions)
                    .map(|_| {
                        // xorshift64 keeps the sequence deterministic per text
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        ((state % 2000) as f32 / 1000.0) - 1.0
                    })
                    .collect();

                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in &mut vector {
                        *v /= norm;
                    }
                }
                vector
            })
            .collect();

        Ok(EmbeddedBatch {
            vectors,
            warnings: Vec::new(),
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed_query("alpha secret").await.unwrap();
        let b = embedder.embed_query("alpha secret").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_hash_embedder_distinct_texts() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed_query("first").await.unwrap();
        let b = embedder.embed_query("second").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_hash_embedder_unit_norm() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed_query("anything").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order_and_length() {
        let embedder = HashEmbedder::new(16);
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let batch = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(batch.vectors.len(), 5);
        let first = embedder.embed_query("text 0").await.unwrap();
        assert_eq!(batch.vectors[0], first);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let embedder = HashEmbedder::default();
        let batch = embedder.embed_batch(&[]).await.unwrap();
        assert!(batch.vectors.is_empty());
        assert!(batch.warnings.is_empty());
    }

    #[test]
    fn test_with_limits_overrides_defaults() {
        let embedder = HttpEmbedder::new("http://localhost", "key", "model", 16)
            .unwrap()
            .with_limits(256, 64);
        assert_eq!(embedder.max_batch, 256);
        assert_eq!(embedder.max_item_tokens, 64);
    }

    #[test]
    fn test_pre_truncate_honours_configured_cap() {
        let embedder = HttpEmbedder::new("http://localhost", "key", "model", 16)
            .unwrap()
            .with_limits(128, 8);

        let long = "word ".repeat(100);
        let (prepared, warnings) =
            embedder.pre_truncate(&["short".to_string(), long.clone()]);

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0], "short");
        assert!(prepared[1].len() < long.len());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("item 1"));
    }
}
