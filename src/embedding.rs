//! Embedding computation for ingestion and query-time retrieval.
//!
//! The [`Embedder`] trait is the seam between the pipelines and the model
//! provider; [`ProviderEmbedder`] dispatches on the embedding model's
//! closed [`Provider`](crate::models::Provider) union. Each batch reports
//! the provider-side token count so usage accounting can record embedding
//! cost per request.
//!
//! # Retry Strategy
//!
//! The OpenAI path uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::models::{EmbeddingModel, Provider};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const MAX_RETRIES: u32 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// One embedding call's result: vectors in input order plus the
/// provider-reported token count for the whole batch.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u64,
}

/// Seam between the pipelines and the embedding provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts with the given model configuration.
    async fn embed(&self, model: &EmbeddingModel, texts: &[String]) -> Result<EmbeddingBatch>;
}

/// Dispatches embedding calls on the model's provider kind.
pub struct ProviderEmbedder {
    client: reqwest::Client,
}

impl ProviderEmbedder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, model: &EmbeddingModel, texts: &[String]) -> Result<EmbeddingBatch> {
        match model.provider {
            Provider::OpenAi => embed_openai(&self.client, model, texts).await,
            Provider::GigaChat => bail!(
                "Embedding provider '{}' is not supported yet",
                model.provider.as_str()
            ),
        }
    }
}

/// Embed a single query text; convenience wrapper for retrieval.
pub async fn embed_query(
    embedder: &dyn Embedder,
    model: &EmbeddingModel,
    text: &str,
) -> Result<EmbeddingBatch> {
    let batch = embedder.embed(model, &[text.to_string()]).await?;
    if batch.vectors.is_empty() {
        bail!("Empty embedding response");
    }
    Ok(batch)
}

/// Call the OpenAI embeddings API with retry/backoff.
async fn embed_openai(
    client: &reqwest::Client,
    model: &EmbeddingModel,
    texts: &[String],
) -> Result<EmbeddingBatch> {
    let body = serde_json::json!({
        "model": model.model_name,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(OPENAI_EMBEDDINGS_URL)
            .header("Authorization", format!("Bearer {}", model.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_openai_response(&json);
                }

                // Rate limited or server error — retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "OpenAI API error {}: {}",
                        status,
                        body_text
                    ));
                    continue;
                }

                // Client error (not 429) — don't retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("OpenAI API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays in order plus `usage.total_tokens`.
fn parse_openai_response(json: &serde_json::Value) -> Result<EmbeddingBatch> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut vectors = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        vectors.push(vec);
    }

    let total_tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok(EmbeddingBatch {
        vectors,
        total_tokens,
    })
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
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

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "data": [
                {"index": 0, "embedding": [0.1, 0.2, 0.3]},
                {"index": 1, "embedding": [0.4, 0.5, 0.6]},
            ],
            "usage": {"prompt_tokens": 12, "total_tokens": 12},
        });
        let batch = parse_openai_response(&json).unwrap();
        assert_eq!(batch.vectors.len(), 2);
        assert_eq!(batch.vectors[0], vec![0.1, 0.2, 0.3]);
        assert_eq!(batch.total_tokens, 12);
    }

    #[test]
    fn test_parse_missing_data_fails() {
        let json = serde_json::json!({"usage": {"total_tokens": 3}});
        assert!(parse_openai_response(&json).is_err());
    }

    #[test]
    fn test_parse_missing_usage_defaults_zero() {
        let json = serde_json::json!({"data": []});
        let batch = parse_openai_response(&json).unwrap();
        assert_eq!(batch.total_tokens, 0);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_or_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
