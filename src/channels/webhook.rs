//! Webhook channel
//!
//! Posts each publication as a JSON document.
//!
//! # Payload Format
//!
//! ```json
//! {
//!   "fingerprint": "3f2a…",
//!   "title": "Headline",
//!   "description": "Body text",
//!   "link": "https://news.example.com/a/1",
//!   "image": "bd3a…_0c1d2e3f.jpg",
//!   "source": "Example News",
//!   "emitted_at": "2024-01-01T12:00:00Z"
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ChannelError, ChannelResult, DeliveryStatus, Emitter};
use crate::pipeline::Publication;
use crate::supervisor::SessionHandle;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    #[serde(default)]
    pub url: String,
    /// Optional authentication token (sent as Bearer token)
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Custom headers to include in requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl WebhookConfig {
    /// Create a new webhook configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
        }
    }

    /// Set authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Webhook channel
pub struct WebhookChannel {
    config: WebhookConfig,
    session: Arc<SessionHandle>,
    retry: RetryConfig,
}

impl WebhookChannel {
    /// Create a new webhook channel
    pub fn new(config: WebhookConfig, session: Arc<SessionHandle>) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;
        let retry = RetryConfig::new(config.max_retries);
        Ok(Self {
            config,
            session,
            retry,
        })
    }

    /// Override the backoff schedule
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the webhook URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, publication: &Publication) -> serde_json::Value {
        serde_json::json!({
            "fingerprint": publication.fingerprint,
            "title": publication.title,
            "description": publication.description,
            "link": publication.link,
            "image": publication
                .image_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string()),
            "source": publication.source,
            "emitted_at": chrono::Utc::now().to_rfc3339(),
        })
    }

    async fn post_once(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let lease = self.session.acquire().await?;
        let mut request = lease
            .client
            .post(&self.config.url)
            .timeout(Duration::from_secs(self.config.timeout_secs));

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = match request.json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = ChannelError::HttpError(e);
                if err.is_connection_failure() {
                    self.session.invalidate(lease.generation).await;
                }
                return Err(err);
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %self.config.url, status = %status, "Webhook accepted");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        Err(ChannelError::from_status(status, body))
    }
}

#[async_trait]
impl Emitter for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn emit(&self, publication: &Publication) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(publication);

        with_retry_if(&self.retry, || self.post_once(&payload), ChannelError::is_retryable)
            .await
            .map(|()| DeliveryStatus::success_with_message("webhook", format!("Delivered to {}", self.config.url)))
            .inspect_err(|e| {
                tracing::error!(url = %self.config.url, error = %e, "Failed to deliver webhook");
            })
    }

    async fn health_check(&self) -> ChannelResult<bool> {
        let lease = self.session.acquire().await?;
        match lease.client.head(&self.config.url).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(url = %self.config.url, error = %e, "Webhook health check failed");
                Ok(false)
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "url": self.config.url,
            "timeout_secs": self.config.timeout_secs,
            "max_retries": self.config.max_retries,
            "has_auth": self.config.auth_token.is_some(),
            "custom_headers": self.config.headers.keys().collect::<Vec<_>>(),
        })
    }
}
