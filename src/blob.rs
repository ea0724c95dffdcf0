//! Filesystem blob store for raw uploaded document bytes.
//!
//! The core never interprets these bytes; it only saves them on upload and
//! reads them back during ingestion. The returned blob reference is a path
//! relative to the configured root (`documents/user/{user_id}/{filename}`),
//! opaque to everything outside this module.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Save uploaded bytes, returning the blob reference.
    pub fn save(&self, user_id: &str, file_name: &str, bytes: &[u8]) -> Result<String> {
        // Strip any path components a client may have smuggled into the name
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin");

        let rel = format!("documents/user/{}/{}", user_id, file_name);
        let path = self.root.join(&rel);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create blob directory {}", parent.display()))?;
        }

        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write blob {}", path.display()))?;

        Ok(rel)
    }

    /// Read the raw bytes back by blob reference.
    pub fn open(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.root.join(blob_ref);
        std::fs::read(&path).with_context(|| format!("Failed to read blob {}", path.display()))
    }

    /// File name component of a blob reference (used by text extraction).
    pub fn file_name(blob_ref: &str) -> &str {
        blob_ref.rsplit('/').next().unwrap_or(blob_ref)
    }
}
