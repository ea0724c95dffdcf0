//! Remote text-extraction client.
//!
//! Ingestion hands the extraction service a materialized file and gets
//! plain UTF-8 text back (`POST file -> text`). The service owns all
//! format knowledge (PDF, OOXML, scans); this module only speaks HTTP.
//! Failures are retryable — the job dispatcher re-runs the whole
//! ingestion attempt.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::config::ExtractionConfig;

/// Seam between the ingestion pipeline and the extraction service.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract plain text from the file at `path`.
    async fn extract(&self, path: &Path) -> Result<String>;
}

/// HTTP client for the external file-to-string service.
pub struct RemoteExtractor {
    client: reqwest::Client,
    url: String,
}

impl RemoteExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl TextExtractor for RemoteExtractor {
    async fn extract(&self, path: &Path) -> Result<String> {
        info!(file = %path.display(), "Parsing file");

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read file for extraction: {}", path.display()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Extraction service unreachable: {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(file = %path.display(), %status, %body, "Failed to parse file");
            bail!("Extraction service error {}: {}", status, body);
        }

        let text = response.text().await?;
        info!(file = %path.display(), "Successfully parsed file");
        Ok(text)
    }
}
