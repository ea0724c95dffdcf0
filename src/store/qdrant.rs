//! Qdrant-backed vector store, speaking the REST API.
//!
//! All documents share one collection; per-document scoping rides on a
//! `doc_id` payload field. Deleting by `doc_id` before every upsert makes
//! re-ingestion overwrite instead of duplicate.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::VectorStoreConfig;

use super::{rank_and_cut, ChunkVector, ScoredPoint, StoreError, StoreResult, VectorStore};

#[derive(Clone)]
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.base_url, self.collection, suffix
        )
    }

    /// Filter matching any of the allowed document ids (disjunctive).
    fn doc_filter(document_ids: &[String]) -> serde_json::Value {
        json!({
            "should": document_ids
                .iter()
                .map(|id| json!({"key": "doc_id", "match": {"value": id}}))
                .collect::<Vec<_>>(),
        })
    }

    /// Create the shared collection if it does not exist yet.
    async fn ensure_collection(&self, dims: usize) -> StoreResult<()> {
        let resp = self
            .client
            .get(self.collection_url(""))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }

        debug!(collection = %self.collection, dims, "Creating collection");
        let resp = self
            .client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": {"size": dims, "distance": "Cosine"},
            }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        check_status(resp).await.map(|_| ())
    }
}

async fn check_status(resp: reqwest::Response) -> StoreResult<serde_json::Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(StoreError::Unavailable(format!("{}: {}", status, body)));
    }
    resp.json()
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, document_id: &str, chunks: &[ChunkVector]) -> StoreResult<()> {
        if let Some(first) = chunks.first() {
            self.ensure_collection(first.vector.len()).await?;
        }

        // Drop any points from a previous run of this document
        let resp = self
            .client
            .post(self.collection_url("/points/delete?wait=true"))
            .json(&json!({
                "filter": {
                    "must": [{"key": "doc_id", "match": {"value": document_id}}],
                },
            }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        check_status(resp).await?;

        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<serde_json::Value> = chunks
            .iter()
            .map(|chunk| {
                let mut payload = chunk.payload.clone();
                if let Some(map) = payload.as_object_mut() {
                    map.insert("text".to_string(), json!(chunk.text));
                }
                json!({
                    "id": chunk.id,
                    "vector": chunk.vector,
                    "payload": payload,
                })
            })
            .collect();

        let resp = self
            .client
            .put(self.collection_url("/points?wait=true"))
            .json(&json!({"points": points}))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        check_status(resp).await?;

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        allowed_document_ids: &[String],
        top_k: usize,
        similarity_cutoff: f64,
    ) -> StoreResult<Vec<ScoredPoint>> {
        if allowed_document_ids.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .client
            .post(self.collection_url("/points/search"))
            .json(&json!({
                "vector": vector,
                "limit": top_k,
                "with_payload": true,
                "filter": Self::doc_filter(allowed_document_ids),
            }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let body = check_status(resp).await?;
        let hits = body
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let points: Vec<ScoredPoint> = hits
            .iter()
            .map(|hit| {
                let payload = hit.get("payload").cloned().unwrap_or(json!({}));
                let text = payload
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                ScoredPoint {
                    id: hit
                        .get("id")
                        .map(|i| i.to_string().trim_matches('"').to_string())
                        .unwrap_or_default(),
                    score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                    text,
                    payload,
                }
            })
            .collect();

        // Qdrant already orders and limits; re-apply the contract locally
        // so the cutoff semantics match every other backend.
        Ok(rank_and_cut(points, top_k, similarity_cutoff))
    }

    async fn exists(&self, document_id: &str) -> StoreResult<bool> {
        let resp = self
            .client
            .post(self.collection_url("/points/count"))
            .json(&json!({
                "filter": {
                    "must": [{"key": "doc_id", "match": {"value": document_id}}],
                },
                "exact": true,
            }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let body = check_status(resp).await?;
        let count = body
            .get("result")
            .and_then(|r| r.get("count"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_filter_is_disjunctive() {
        let filter = QdrantStore::doc_filter(&["d1".to_string(), "d2".to_string()]);
        let should = filter.get("should").unwrap().as_array().unwrap();
        assert_eq!(should.len(), 2);
        assert_eq!(should[0]["key"], "doc_id");
        assert_eq!(should[0]["match"]["value"], "d1");
        assert_eq!(should[1]["match"]["value"], "d2");
    }
}
