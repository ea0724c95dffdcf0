//! In-memory vector store backend, used by tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::embedding::cosine_similarity;

use super::{rank_and_cut, ChunkVector, ScoredPoint, StoreResult, VectorStore};

#[derive(Default)]
pub struct MemoryStore {
    points: RwLock<HashMap<String, Vec<ChunkVector>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored points for a document. Test helper.
    pub fn point_count(&self, document_id: &str) -> usize {
        self.points
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, document_id: &str, chunks: &[ChunkVector]) -> StoreResult<()> {
        let mut points = self.points.write().unwrap_or_else(|e| e.into_inner());
        points.insert(document_id.to_string(), chunks.to_vec());
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

        let points = self.points.read().unwrap_or_else(|e| e.into_inner());

        let candidates: Vec<ScoredPoint> = allowed_document_ids
            .iter()
            .filter_map(|doc_id| points.get(doc_id))
            .flatten()
            .map(|chunk| ScoredPoint {
                id: chunk.id.clone(),
                score: cosine_similarity(vector, &chunk.vector) as f64,
                text: chunk.text.clone(),
                payload: chunk.payload.clone(),
            })
            .collect();

        Ok(rank_and_cut(candidates, top_k, similarity_cutoff))
    }

    async fn exists(&self, document_id: &str) -> StoreResult<bool> {
        let points = self.points.read().unwrap_or_else(|e| e.into_inner());
        Ok(points.get(document_id).is_some_and(|v| !v.is_empty()))
    }
}
