//! Retrieval and answer pipelines.
//!
//! Both entry points take a query, the requesting user, and the target
//! document ids. The document set is first resolved down to what the user
//! may actually search (ownership, grants, full access); retrieval is then
//! a single vector-store query constrained to that set. Quick search
//! additionally assembles a prompt from the retrieved passages and asks
//! the search model for an answer.
//!
//! Token counters are a per-request accumulator, taken (and thereby reset)
//! exactly once when the usage row is assembled — nothing is shared across
//! requests.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::catalog;
use crate::documents;
use crate::embedding::{embed_query, Embedder};
use crate::llm::AnswerGenerator;
use crate::models::{
    EmbeddingModel, Language, Node, SearchModel, TokenCounts, UsageKind,
};
use crate::store::{ScoredPoint, VectorStore};
use crate::usage;

/// Default answer-synthesis template used when no active
/// [`Prompt`](crate::models::Prompt) exists for the requested language.
const DEFAULT_USER_PROMPT: &str = "Context information is below.\n\
---------------------\n\
{context}\n\
---------------------\n\
Given the context information and not prior knowledge, answer the query.\n\
Query: {query}\n\
Answer:";

/// Collaborators shared by both search pipelines.
#[derive(Clone)]
pub struct SearchDeps {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub store: Arc<dyn VectorStore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuickSearchRequest {
    pub query: String,
    pub documents: Vec<String>,
    /// Embedding model selector (display name or id).
    pub knowledge_model: String,
    /// Search model selector (display name or id).
    pub search_model: String,
    #[serde(default = "default_language")]
    pub language: Language,
}

fn default_language() -> Language {
    Language::Ru
}

#[derive(Debug, Serialize)]
pub struct QuickSearchResponse {
    pub answer: String,
    pub nodes: Vec<Node>,
    pub usage: TokenCounts,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodesSearchRequest {
    pub query: String,
    pub documents: Vec<String>,
    pub knowledge_model: String,
    pub similarity_top_k: Option<usize>,
    pub similarity_cutoff: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct NodesSearchResponse {
    pub nodes: Vec<Node>,
    pub usage: TokenCounts,
}

impl QuickSearchRequest {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            bail!("query must not be empty");
        }
        Ok(())
    }
}

impl NodesSearchRequest {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            bail!("query must not be empty");
        }
        if let Some(cutoff) = self.similarity_cutoff {
            if !(0.0..=1.0).contains(&cutoff) {
                bail!("similarity_cutoff must be in [0.0, 1.0]");
            }
        }
        if self.similarity_top_k == Some(0) {
            bail!("similarity_top_k must be > 0");
        }
        Ok(())
    }
}

/// Request-scoped token accumulator. `take` hands the counts out and
/// resets the accumulator; counts never leak into the next request.
#[derive(Debug, Default)]
pub struct TokenCounter {
    prompt: u64,
    completion: u64,
    embedding: u64,
}

impl TokenCounter {
    pub fn add_llm(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt += prompt_tokens;
        self.completion += completion_tokens;
    }

    pub fn add_embedding(&mut self, tokens: u64) {
        self.embedding += tokens;
    }

    pub fn take(&mut self) -> TokenCounts {
        let counts = TokenCounts {
            prompt_llm_token_count: self.prompt,
            completion_llm_token_count: self.completion,
            total_llm_token_count: self.prompt + self.completion,
            total_embedding_token_count: self.embedding,
        };
        self.prompt = 0;
        self.completion = 0;
        self.embedding = 0;
        counts
    }
}

/// Retrieve passages and synthesize an answer with the search model.
#[allow(clippy::too_many_arguments)]
pub async fn quick_search(
    pool: &SqlitePool,
    deps: &SearchDeps,
    user_id: &str,
    embedding_model: &EmbeddingModel,
    search_model: &SearchModel,
    request: &QuickSearchRequest,
    top_k: usize,
    cutoff: f64,
) -> Result<QuickSearchResponse> {
    let scope = documents::resolve_scope(pool, user_id, &request.documents).await?;
    let mut counter = TokenCounter::default();

    let nodes = retrieve(deps, embedding_model, &request.query, &scope, top_k, cutoff, &mut counter)
        .await?;

    let (system_prompt, user_template) = resolve_prompt(pool, request.language).await?;
    let context: Vec<&str> = nodes.iter().map(|n| n.content.as_str()).collect();
    let user_prompt = render_prompt(&user_template, &context.join("\n\n"), &request.query);

    let completion = deps
        .generator
        .generate(search_model, &system_prompt, &user_prompt)
        .await?;
    counter.add_llm(completion.prompt_tokens, completion.completion_tokens);

    let counts = counter.take();
    let assembled_prompt = if system_prompt.is_empty() {
        user_prompt
    } else {
        format!("{} {}", system_prompt, user_prompt)
    };

    usage::record_usage(
        pool,
        UsageKind::QuickSearch,
        user_id,
        counts,
        &request.query,
        &assembled_prompt,
        &completion.text,
    )
    .await?;

    info!(
        user_id,
        nodes = nodes.len(),
        total_tokens = counts.total_llm_token_count,
        "Quick search completed"
    );

    Ok(QuickSearchResponse {
        answer: completion.text,
        nodes,
        usage: counts,
        metadata: json!({
            "search_model": search_model.display_name,
            "estimated_cost": search_model.estimate_cost(
                counts.prompt_llm_token_count,
                counts.completion_llm_token_count,
            ),
        }),
    })
}

/// Retrieve ranked passages without answer synthesis.
pub async fn nodes_search(
    pool: &SqlitePool,
    deps: &SearchDeps,
    user_id: &str,
    embedding_model: &EmbeddingModel,
    request: &NodesSearchRequest,
    default_top_k: usize,
    default_cutoff: f64,
) -> Result<NodesSearchResponse> {
    let scope = documents::resolve_scope(pool, user_id, &request.documents).await?;
    let mut counter = TokenCounter::default();

    let top_k = request.similarity_top_k.unwrap_or(default_top_k);
    let cutoff = request.similarity_cutoff.unwrap_or(default_cutoff);

    let nodes = retrieve(
        deps,
        embedding_model,
        &request.query,
        &scope,
        top_k,
        cutoff,
        &mut counter,
    )
    .await?;

    // No generation step; the row still lands with embedding tokens only
    let counts = counter.take();
    usage::record_usage(
        pool,
        UsageKind::NodesSearch,
        user_id,
        counts,
        &request.query,
        "",
        "",
    )
    .await?;

    info!(user_id, nodes = nodes.len(), "Nodes search completed");

    Ok(NodesSearchResponse {
        nodes,
        usage: counts,
    })
}

/// Embed the query and fetch matching passages from the allowed documents.
async fn retrieve(
    deps: &SearchDeps,
    embedding_model: &EmbeddingModel,
    query: &str,
    scope: &[String],
    top_k: usize,
    cutoff: f64,
    counter: &mut TokenCounter,
) -> Result<Vec<Node>> {
    // An empty scope never reaches the store: zero results, not match-all.
    if scope.is_empty() {
        return Ok(Vec::new());
    }

    let batch = embed_query(deps.embedder.as_ref(), embedding_model, query).await?;
    counter.add_embedding(batch.total_tokens);

    let points = deps
        .store
        .query(&batch.vectors[0], scope, top_k, cutoff)
        .await?;

    Ok(points.into_iter().map(point_to_node).collect())
}

fn point_to_node(point: ScoredPoint) -> Node {
    Node {
        id: point.id,
        score: Some(point.score),
        content: point.text,
        metadata: point.payload,
    }
}

/// Resolve the (system, user) prompt pair for a language: the most recent
/// active prompt wins, otherwise the built-in default template.
async fn resolve_prompt(pool: &SqlitePool, language: Language) -> Result<(String, String)> {
    match catalog::latest_prompt(pool, language).await? {
        Some(prompt) => Ok((prompt.system_prompt, prompt.user_prompt)),
        None => Ok((String::new(), DEFAULT_USER_PROMPT.to_string())),
    }
}

fn render_prompt(template: &str, context: &str, query: &str) -> String {
    template
        .replace("{context}", context)
        .replace("{query}", query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counter_take_resets() {
        let mut counter = TokenCounter::default();
        counter.add_llm(10, 5);
        counter.add_embedding(7);

        let counts = counter.take();
        assert_eq!(counts.prompt_llm_token_count, 10);
        assert_eq!(counts.completion_llm_token_count, 5);
        assert_eq!(counts.total_llm_token_count, 15);
        assert_eq!(counts.total_embedding_token_count, 7);

        // Not cumulative across uses
        let empty = counter.take();
        assert_eq!(empty, TokenCounts::default());
    }

    #[test]
    fn test_render_prompt() {
        let rendered = render_prompt("Use {context} to answer {query}.", "CTX", "Q");
        assert_eq!(rendered, "Use CTX to answer Q.");
    }

    #[test]
    fn test_default_template_has_placeholders() {
        assert!(DEFAULT_USER_PROMPT.contains("{context}"));
        assert!(DEFAULT_USER_PROMPT.contains("{query}"));
    }

    #[test]
    fn test_nodes_request_validation() {
        let mut request = NodesSearchRequest {
            query: "what is rust".to_string(),
            documents: vec!["d1".to_string()],
            knowledge_model: "ada".to_string(),
            similarity_top_k: None,
            similarity_cutoff: None,
        };
        assert!(request.validate().is_ok());

        request.similarity_cutoff = Some(1.5);
        assert!(request.validate().is_err());

        request.similarity_cutoff = Some(0.5);
        request.similarity_top_k = Some(0);
        assert!(request.validate().is_err());

        request.similarity_top_k = Some(3);
        request.query = "   ".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_quick_request_validation() {
        let request = QuickSearchRequest {
            query: "".to_string(),
            documents: vec![],
            knowledge_model: "ada".to_string(),
            search_model: "gpt".to_string(),
            language: Language::En,
        };
        assert!(request.validate().is_err());
    }
}
