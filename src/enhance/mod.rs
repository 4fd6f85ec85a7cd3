//! Content rewriting before emission
//!
//! An [`Enhancer`] either returns rewritten text, refuses the item, or fails
//! transiently. Refusal drops the item for good this cycle; a failure leaves
//! it unrecorded so it is offered again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EnhancerConfig;
use crate::supervisor::SessionHandle;
use crate::utils::strip_markup;

/// Result of one enhancement attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhanceOutcome {
    /// Rewritten content, ready to publish
    Enhanced { title: String, description: String },
    /// Do not publish this item
    Rejected { reason: String },
    /// Transient failure; try again later
    Failed(String),
}

impl EnhanceOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enhanced { .. } => "enhanced",
            Self::Rejected { .. } => "rejected",
            Self::Failed(_) => "failed",
        }
    }
}

/// Rewrites a title and description
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, title: &str, description: &str) -> EnhanceOutcome;
}

/// Publishes content unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEnhancer;

#[async_trait]
impl Enhancer for PassthroughEnhancer {
    async fn enhance(&self, title: &str, description: &str) -> EnhanceOutcome {
        EnhanceOutcome::Enhanced {
            title: title.to_string(),
            description: description.to_string(),
        }
    }
}

/// Ollama generate request
#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

/// Ollama generation options
#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Shape the model is asked to answer with
#[derive(Debug, Default, Deserialize)]
struct Rewrite {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Ollama-compatible rewriting client
pub struct LlmEnhancer {
    config: EnhancerConfig,
    session: Arc<SessionHandle>,
}

impl LlmEnhancer {
    pub fn new(config: EnhancerConfig, session: Arc<SessionHandle>) -> Self {
        Self { config, session }
    }

    fn build_prompt(&self, title: &str, description: &str) -> String {
        format!(
            r#"Rewrite the news item below for a news channel. Keep the facts, drop advertising and calls to action.

Title: {title}
Text: {description}

Answer only with JSON:
{{"title": "<rewritten title>", "description": "<rewritten text>"}}

If the item is advertising, empty or not news, answer:
{{"skip": true, "reason": "<short reason>"}}"#
        )
    }

    /// Generate text using Ollama
    async fn generate(&self, prompt: String) -> Result<String, String> {
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        let request = OllamaRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let lease = self.session.acquire().await.map_err(|e| e.to_string())?;
        let response = match lease
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_connect() || e.is_request() {
                    self.session.invalidate(lease.generation).await;
                }
                return Err(format!("request to {url} failed: {e}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Ollama request failed: {status} - {body}"));
        }

        response
            .json::<OllamaResponse>()
            .await
            .map(|r| r.response)
            .map_err(|e| format!("Failed to parse Ollama response: {e}"))
    }
}

#[async_trait]
impl Enhancer for LlmEnhancer {
    async fn enhance(&self, title: &str, description: &str) -> EnhanceOutcome {
        let raw = match self.generate(self.build_prompt(title, description)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(model = %self.config.model, error = %e, "Enhancement failed");
                return EnhanceOutcome::Failed(e);
            }
        };
        let outcome = interpret_response(&raw, title);
        tracing::debug!(outcome = outcome.kind(), "Enhancement finished");
        outcome
    }
}

/// Turn a raw model answer into an outcome
///
/// A missing title falls back to `original_title`; an empty description is
/// a refusal.
pub fn interpret_response(raw: &str, original_title: &str) -> EnhanceOutcome {
    if raw.trim().is_empty() {
        return EnhanceOutcome::Rejected {
            reason: "empty response".to_string(),
        };
    }

    let json = extract_json(raw);
    let rewrite: Rewrite = match serde_json::from_str(&json) {
        Ok(rewrite) => rewrite,
        Err(e) => {
            let preview: String = raw.chars().take(200).collect();
            tracing::warn!(error = %e, response = %preview, "Unparseable enhancement response");
            return EnhanceOutcome::Failed(format!("unparseable response: {e}"));
        }
    };

    if rewrite.skip {
        return EnhanceOutcome::Rejected {
            reason: rewrite.reason.unwrap_or_else(|| "skipped by model".to_string()),
        };
    }

    let description = rewrite
        .description
        .map(|d| strip_markup(&d))
        .unwrap_or_default();
    if description.is_empty() {
        return EnhanceOutcome::Rejected {
            reason: "empty description".to_string(),
        };
    }

    let title = rewrite
        .title
        .map(|t| strip_markup(&t))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| original_title.to_string());

    EnhanceOutcome::Enhanced { title, description }
}

/// Extract JSON from markdown code blocks or raw text
fn extract_json(text: &str) -> String {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return text[start + 7..start + 7 + end].trim().to_string();
        }
    }

    if let Some(start) = text.find("```") {
        let after_start = &text[start + 3..];
        let content_start = after_start.find('\n').map_or(0, |i| i + 1);
        if let Some(end) = after_start[content_start..].find("```") {
            return after_start[content_start..content_start + end]
                .trim()
                .to_string();
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            return text[start..=end].to_string();
        }
    }

    text.trim().to_string()
}
