//! Core data models used throughout the document search service.
//!
//! These types represent the documents, model configurations, prompts, and
//! usage records that flow through the ingestion and retrieval pipelines.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Vectorization state of a document.
///
/// Transitions: `NotStarted` → `InProgress` → `Done` | `Error`. The
/// `NotStarted` → `InProgress` transition is persisted before any network
/// I/O, so a crash mid-job is visible as a document stuck `InProgress`
/// until the failure handler forces `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    NotStarted,
    InProgress,
    Done,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::NotStarted => "not_started",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Done => "done",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(ProcessingStatus::NotStarted),
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "done" => Ok(ProcessingStatus::Done),
            "error" => Ok(ProcessingStatus::Error),
            other => bail!("Unknown processing status: '{}'", other),
        }
    }
}

/// Closed set of model providers.
///
/// Adding a provider means adding a variant here and a dispatch arm in
/// the embedding and answer-generation clients — not subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    GigaChat,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::GigaChat => "giga_chat",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "giga_chat" => Ok(Provider::GigaChat),
            other => bail!("Unknown provider: '{}'", other),
        }
    }
}

/// Answer language for quick search; selects the prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Ru,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Ru => "ru",
            Language::En => "en",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ru" => Ok(Language::Ru),
            "en" => Ok(Language::En),
            other => bail!("Unknown language: '{}'", other),
        }
    }
}

/// An uploaded document and its vectorization state.
///
/// The raw bytes live in the blob store under `blob_ref`; the vectors live
/// in the vector store tagged with `id`. Soft-deleted documents
/// (`deleted_at` set) are excluded from every listing and search scope, but
/// their vectors are not removed from the store.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub blob_ref: String,
    pub embedding_model_id: String,
    pub processing_status: ProcessingStatus,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

/// Named embedding-provider configuration.
///
/// Chunking parameters travel with the model so re-ingestion of a document
/// uses the same windows its vectors were built with.
#[derive(Debug, Clone)]
pub struct EmbeddingModel {
    pub id: String,
    pub display_name: String,
    pub provider: Provider,
    pub api_key: String,
    /// Provider-side model name, e.g. `"text-embedding-3-small"`.
    pub model_name: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub is_active: bool,
}

/// Named answer-generation model configuration with per-1000-token pricing.
#[derive(Debug, Clone)]
pub struct SearchModel {
    pub id: String,
    pub display_name: String,
    pub provider: Provider,
    pub api_key: String,
    /// Provider-side model name, e.g. `"gpt-4o-mini"`.
    pub model_name: String,
    pub price_per_1k_input_tokens: f64,
    pub price_per_1k_output_tokens: f64,
    pub is_active: bool,
}

impl SearchModel {
    /// Estimated cost of a call from provider-reported token counts.
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.price_per_1k_input_tokens
            + completion_tokens as f64 / 1000.0 * self.price_per_1k_output_tokens
    }
}

/// Language-tagged system/user prompt template pair.
///
/// The most recently created active prompt per language wins; when none
/// exists, answer synthesis falls back to a built-in template.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub id: String,
    pub language: Language,
    pub system_prompt: String,
    pub user_prompt: String,
    pub is_active: bool,
    pub created_at: i64,
}

/// Search invocation kind recorded on a [`Usage`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    QuickSearch,
    NodesSearch,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::QuickSearch => "quick_search",
            UsageKind::NodesSearch => "nodes_search",
        }
    }
}

/// Per-request token counters, reported back to the caller and persisted
/// on the [`Usage`] row. Nodes search carries embedding tokens only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt_llm_token_count: u64,
    pub completion_llm_token_count: u64,
    pub total_llm_token_count: u64,
    pub total_embedding_token_count: u64,
}

/// Immutable record of one search invocation. Created once, never mutated.
#[derive(Debug, Clone)]
pub struct Usage {
    pub id: String,
    pub kind: UsageKind,
    pub user_id: String,
    pub counts: TokenCounts,
    pub query: String,
    pub prompt: String,
    pub response: String,
    pub created_at: i64,
}

/// A retrieved passage. Produced by the retrieval pipeline, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub score: Option<f64>,
    pub content: String,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ProcessingStatus::NotStarted,
            ProcessingStatus::InProgress,
            ProcessingStatus::Done,
            ProcessingStatus::Error,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ProcessingStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(Provider::parse("openai").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::parse("giga_chat").unwrap(), Provider::GigaChat);
        assert!(Provider::parse("cohere").is_err());
    }

    #[test]
    fn test_estimate_cost() {
        let model = SearchModel {
            id: "m1".to_string(),
            display_name: "gpt".to_string(),
            provider: Provider::OpenAi,
            api_key: "k".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            price_per_1k_input_tokens: 0.0015,
            price_per_1k_output_tokens: 0.002,
            is_active: true,
        };
        let cost = model.estimate_cost(2000, 500);
        assert!((cost - (0.003 + 0.001)).abs() < 1e-12);
    }
}
