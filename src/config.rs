use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub blobs: BlobConfig,
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    /// Root directory for uploaded document bytes. Files land under
    /// `documents/user/{user_id}/{filename}`.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Text-extraction service endpoint (`POST file -> plain text`).
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// `"qdrant"` or `"memory"`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-user store handle cache: max entries and entry lifetime.
    #[serde(default = "default_handle_cache_size")]
    pub handle_cache_size: usize,
    #[serde(default = "default_handle_cache_ttl_secs")]
    pub handle_cache_ttl_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_qdrant_url(),
            collection: default_collection(),
            timeout_secs: default_timeout_secs(),
            handle_cache_size: default_handle_cache_size(),
            handle_cache_ttl_secs: default_handle_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,
    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: default_similarity_top_k(),
            similarity_cutoff: default_similarity_cutoff(),
        }
    }
}

/// Retry policy for ingestion jobs, passed explicitly to the dispatcher.
///
/// Delay for attempt `n` is `min(interval_start + n * interval_step,
/// interval_max)` plus jitter in `[0, jitter_max_secs]`.
#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_interval_start")]
    pub interval_start_secs: u64,
    #[serde(default = "default_interval_step")]
    pub interval_step_secs: u64,
    #[serde(default = "default_interval_max")]
    pub interval_max_secs: u64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: u64,
    /// How long a claimed job may run before it is considered abandoned
    /// and put back in the queue.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
    /// How often an idle worker polls for queued jobs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            interval_start_secs: default_interval_start(),
            interval_step_secs: default_interval_step(),
            interval_max_secs: default_interval_max(),
            jitter_max_secs: default_jitter_max(),
            lease_secs: default_lease(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_store_backend() -> String {
    "qdrant".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "main".to_string()
}
fn default_handle_cache_size() -> usize {
    64
}
fn default_handle_cache_ttl_secs() -> u64 {
    300
}
fn default_similarity_top_k() -> usize {
    100
}
fn default_similarity_cutoff() -> f64 {
    0.5
}
fn default_workers() -> usize {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_interval_start() -> u64 {
    0
}
fn default_interval_step() -> u64 {
    2
}
fn default_interval_max() -> u64 {
    60
}
fn default_jitter_max() -> u64 {
    60
}
fn default_lease() -> u64 {
    600
}
fn default_poll_interval() -> u64 {
    1
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.vector_store.backend.as_str() {
        "qdrant" | "memory" => {}
        other => anyhow::bail!(
            "Unknown vector store backend: '{}'. Must be qdrant or memory.",
            other
        ),
    }

    if config.vector_store.handle_cache_size == 0 {
        anyhow::bail!("vector_store.handle_cache_size must be > 0");
    }

    if config.search.similarity_top_k == 0 {
        anyhow::bail!("search.similarity_top_k must be > 0");
    }

    if !(0.0..=1.0).contains(&config.search.similarity_cutoff) {
        anyhow::bail!("search.similarity_cutoff must be in [0.0, 1.0]");
    }

    if config.extraction.url.is_empty() {
        anyhow::bail!("extraction.url must be set");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[db]
path = "/tmp/docsearch.sqlite"

[blobs]
root = "/tmp/blobs"

[extraction]
url = "http://localhost:9000/file-to-string"

[server]
bind = "127.0.0.1:7420"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config(MINIMAL);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.search.similarity_top_k, 100);
        assert!((config.search.similarity_cutoff - 0.5).abs() < 1e-12);
        assert_eq!(config.jobs.max_retries, 5);
        assert_eq!(config.jobs.interval_max_secs, 60);
        assert_eq!(config.vector_store.backend, "qdrant");
        assert_eq!(config.vector_store.collection, "main");
    }

    #[test]
    fn test_cutoff_out_of_range_rejected() {
        let body = format!("{}\n[search]\nsimilarity_cutoff = 1.5\n", MINIMAL);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let body = format!("{}\n[vector_store]\nbackend = \"pinecone\"\n", MINIMAL);
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }
}
