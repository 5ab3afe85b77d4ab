//! Embedding provider abstraction.
//!
//! The dense index and dense retrieval both go through the [`Embedder`]
//! trait. When no embedder is configured the dense artifact is simply not
//! built and retrieval falls back to sparse + basic search; nothing in the
//! pipeline fails.
//!
//! [`HttpEmbedder`] targets an OpenAI-compatible `POST /v1/embeddings`
//! endpoint with batching and exponential-backoff retry:
//! - HTTP 429 and 5xx → retry (1s, 2s, 4s, 8s, 16s, 32s, capped)
//! - other 4xx → fail immediately
//! - network errors → retry

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Maps text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedder calling an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(endpoint: &str, model: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client,
            max_retries: 5,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embeddings_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("embeddings API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embeddings API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or mismatched lengths.
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

/// Test support: a deterministic in-process embedder.
pub mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes whitespace tokens into a
    /// small fixed-dimension bag-of-words vector.
    pub struct HashEmbedder {
        pub dims: usize,
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn model_name(&self) -> &str {
            "hash-test"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dims];
                    for token in t.to_lowercase().split_whitespace() {
                        let mut h: usize = 0;
                        for b in token.bytes() {
                            h = h.wrapping_mul(31).wrapping_add(b as usize);
                        }
                        v[h % self.dims] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }
}
