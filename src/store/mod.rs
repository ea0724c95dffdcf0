//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only path to the shared multi-tenant
//! vector index. All writes are tagged with the owning document id, and all
//! reads are constrained to an explicit allowed-document set — the store
//! itself never knows about users or access control.
//!
//! Backends:
//! - [`qdrant`] — the production backend, speaking the Qdrant REST API.
//! - [`memory`] — in-process backend for tests.
//!
//! The store is remote and has no local transaction: a crash between
//! `upsert` and the post-write `exists` verification is detectable only by
//! `exists` returning `false`. Every backend failure surfaces as the
//! retryable [`StoreError::Unavailable`].

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Vector store failure. All variants are retryable from the caller's
/// point of view; the job dispatcher decides how often.
#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "vector store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// One embedded chunk ready for upsert.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    /// Point id (chunk UUID).
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    /// Payload stored alongside the vector. Always carries `doc_id`;
    /// ingestion adds `file_name`, `description`, `chunk_index`, `hash`.
    pub payload: serde_json::Value,
}

/// A scored point returned by [`VectorStore::query`].
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub text: String,
    pub payload: serde_json::Value,
}

/// Uniform interface to the shared vector index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace all vectors for `document_id` with `chunks`.
    ///
    /// Idempotent per document: re-running ingestion overwrites, never
    /// duplicates.
    async fn upsert(&self, document_id: &str, chunks: &[ChunkVector]) -> StoreResult<()>;

    /// Retrieve the `top_k` most similar points among the allowed
    /// documents, descending by score, then filtered by
    /// `score >= similarity_cutoff`.
    ///
    /// An empty `allowed_document_ids` set yields zero results — never
    /// "match all".
    async fn query(
        &self,
        vector: &[f32],
        allowed_document_ids: &[String],
        top_k: usize,
        similarity_cutoff: f64,
    ) -> StoreResult<Vec<ScoredPoint>>;

    /// Whether any vectors exist for `document_id`. Used by ingestion as
    /// the post-write verification step.
    async fn exists(&self, document_id: &str) -> StoreResult<bool>;
}

/// Order points descending by score, truncate to `top_k`, then drop
/// everything below the cutoff. Shared by backends so both apply the
/// contract identically (ties retain backend order).
pub fn rank_and_cut(
    mut points: Vec<ScoredPoint>,
    top_k: usize,
    similarity_cutoff: f64,
) -> Vec<ScoredPoint> {
    points.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    points.truncate(top_k);
    points.retain(|p| p.score >= similarity_cutoff);
    points
}

/// Capped, time-bounded cache of per-user store handles.
///
/// Owned by the serving process (it lives in the server state and dies with
/// it); entries expire after `ttl` and the oldest entry is evicted once
/// `max_entries` is reached.
pub struct HandleCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Arc<dyn VectorStore>)>>,
}

impl HandleCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the handle for `user_id`, building it with `make` on miss or
    /// expiry.
    pub fn get_or_insert_with<F>(&self, user_id: &str, make: F) -> Arc<dyn VectorStore>
    where
        F: FnOnce() -> Arc<dyn VectorStore>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some((inserted, handle)) = entries.get(user_id) {
            if now.duration_since(*inserted) < self.ttl {
                return Arc::clone(handle);
            }
        }

        if entries.len() >= self.max_entries && !entries.contains_key(user_id) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (inserted, _))| *inserted)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        let handle = make();
        entries.insert(user_id.to_string(), (now, Arc::clone(&handle)));
        handle
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    fn point(id: &str, score: f64) -> ScoredPoint {
        ScoredPoint {
            id: id.to_string(),
            score,
            text: String::new(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_rank_and_cut_orders_descending() {
        let points = vec![point("a", 0.2), point("b", 0.9), point("c", 0.6)];
        let ranked = rank_and_cut(points, 10, 0.0);
        let ids: Vec<&str> = ranked.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_rank_and_cut_truncates_before_cutoff() {
        // top_k applies first, then the cutoff drops within the window
        let points = vec![
            point("a", 0.95),
            point("b", 0.85),
            point("c", 0.40),
            point("d", 0.30),
            point("e", 0.20),
        ];
        let ranked = rank_and_cut(points, 3, 0.5);
        let ids: Vec<&str> = ranked.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_rank_and_cut_all_below_cutoff() {
        let points = vec![point("a", 0.8), point("b", 0.7)];
        let ranked = rank_and_cut(points, 10, 0.9);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_handle_cache_reuses_within_ttl() {
        let cache = HandleCache::new(4, Duration::from_secs(60));
        let first = cache.get_or_insert_with("u1", || Arc::new(MemoryStore::new()));
        let second = cache.get_or_insert_with("u1", || Arc::new(MemoryStore::new()));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_handle_cache_expires_after_ttl() {
        let cache = HandleCache::new(4, Duration::from_secs(0));
        let first = cache.get_or_insert_with("u1", || Arc::new(MemoryStore::new()));
        let second = cache.get_or_insert_with("u1", || Arc::new(MemoryStore::new()));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_handle_cache_evicts_at_capacity() {
        let cache = HandleCache::new(2, Duration::from_secs(60));
        cache.get_or_insert_with("u1", || Arc::new(MemoryStore::new()));
        cache.get_or_insert_with("u2", || Arc::new(MemoryStore::new()));
        cache.get_or_insert_with("u3", || Arc::new(MemoryStore::new()));
        assert_eq!(cache.len(), 2);
    }
}
