//! Answer generation for quick search.
//!
//! Mirrors the shape of [`embedding`](crate::embedding): a narrow trait
//! seam, a provider-dispatching implementation, and the same retry
//! strategy for transient provider errors.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::models::{Provider, SearchModel};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const MAX_RETRIES: u32 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// A generated answer plus provider-reported token counts.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Seam between the quick-search pipeline and the answer model.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Generate an answer from a system prompt and an assembled user prompt.
    async fn generate(
        &self,
        model: &SearchModel,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion>;
}

/// Dispatches generation calls on the search model's provider kind.
pub struct ProviderGenerator {
    client: reqwest::Client,
}

impl ProviderGenerator {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AnswerGenerator for ProviderGenerator {
    async fn generate(
        &self,
        model: &SearchModel,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion> {
        match model.provider {
            Provider::OpenAi => {
                generate_openai(&self.client, model, system_prompt, user_prompt).await
            }
            Provider::GigaChat => bail!(
                "Answer provider '{}' is not supported yet",
                model.provider.as_str()
            ),
        }
    }
}

/// Call the OpenAI chat completions API with retry/backoff.
async fn generate_openai(
    client: &reqwest::Client,
    model: &SearchModel,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<Completion> {
    let mut messages = Vec::new();
    if !system_prompt.is_empty() {
        messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
    }
    messages.push(serde_json::json!({"role": "user", "content": user_prompt}));

    let body = serde_json::json!({
        "model": model.model_name,
        "messages": messages,
    });

    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(OPENAI_CHAT_URL)
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

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "OpenAI API error {}: {}",
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("OpenAI API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Generation failed after retries")))
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?
        .to_string();

    let usage = json.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok(Completion {
        text,
        prompt_tokens,
        completion_tokens,
    })
}
