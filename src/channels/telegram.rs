//! Telegram Bot API channel
//!
//! Publications are rendered as HTML:
//!
//! ```text
//! <b>{title}</b>
//!
//! {description}
//!
//! <a href='{link}'>Read more</a>
//! ```
//!
//! With an image the text goes out as a `sendPhoto` caption. Captions are
//! limited to 1024 characters; longer text is sent as the photo followed by a
//! separate `sendMessage`.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{ChannelError, ChannelResult, DeliveryStatus, Emitter};
use crate::pipeline::Publication;
use crate::supervisor::SessionHandle;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Telegram caption limit in characters
pub const CAPTION_LIMIT: usize = 1024;

/// Telegram message limit in characters
pub const MESSAGE_LIMIT: usize = 4096;

/// Telegram channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather
    #[serde(default)]
    pub bot_token: String,
    /// Target chat or channel (`@name` or numeric id)
    #[serde(default)]
    pub chat_id: String,
    /// Bot API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Disable link previews on text messages
    #[serde(default)]
    pub disable_preview: bool,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
            disable_preview: false,
        }
    }
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            ..Default::default()
        }
    }

    /// Point at a different API host (tests, local Bot API server)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bot_token.trim().is_empty() {
            return Err("Telegram bot token cannot be empty".to_string());
        }
        if self.chat_id.trim().is_empty() {
            return Err("Telegram chat id cannot be empty".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Render the HTML body of a publication
pub fn format_message(publication: &Publication) -> String {
    let title = html_escape::encode_text(&publication.title);
    let link = html_escape::encode_single_quoted_attribute(&publication.link);
    let mut text = format!("<b>{title}</b>");
    if !publication.description.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(&html_escape::encode_text(&publication.description));
    }
    text.push_str(&format!("\n\n<a href='{link}'>Read more</a>"));
    text
}

/// Telegram channel
pub struct TelegramChannel {
    config: TelegramConfig,
    session: Arc<SessionHandle>,
    retry: RetryConfig,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, session: Arc<SessionHandle>) -> ChannelResult<Self> {
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

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call<F>(&self, method: &str, build: F) -> ChannelResult<Option<String>>
    where
        F: FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        let lease = self.session.acquire().await?;
        let request = lease
            .client
            .post(self.method_url(method))
            .timeout(Duration::from_secs(self.config.timeout_secs));

        let response = match build(request).send().await {
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
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::from_status(status, body));
        }

        let parsed: Value = serde_json::from_str(&body)?;
        if parsed.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = parsed
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: description,
            });
        }

        Ok(parsed
            .pointer("/result/message_id")
            .map(|id| id.to_string()))
    }

    async fn send_message(&self, text: &str) -> ChannelResult<Option<String>> {
        let payload = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": self.config.disable_preview,
        });
        with_retry_if(
            &self.retry,
            || self.call("sendMessage", |req| req.json(&payload)),
            ChannelError::is_retryable,
        )
        .await
    }

    async fn send_photo(
        &self,
        image: &[u8],
        file_name: &str,
        caption: Option<&str>,
    ) -> ChannelResult<Option<String>> {
        let mime = mime_for(file_name);
        with_retry_if(
            &self.retry,
            || async {
                let part = Part::bytes(image.to_vec())
                    .file_name(file_name.to_string())
                    .mime_str(mime)?;
                let mut form = Form::new()
                    .text("chat_id", self.config.chat_id.clone())
                    .part("photo", part);
                if let Some(caption) = caption {
                    form = form
                        .text("caption", caption.to_string())
                        .text("parse_mode", "HTML");
                }
                self.call("sendPhoto", |req| req.multipart(form)).await
            },
            ChannelError::is_retryable,
        )
        .await
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl Emitter for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn emit(&self, publication: &Publication) -> ChannelResult<DeliveryStatus> {
        let text = format_message(publication);

        let image = match &publication.image_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some((bytes, path)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Image unreadable, sending text only");
                    None
                }
            },
            None => None,
        };

        let remote_id = match image {
            Some((bytes, path)) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "image.jpg".to_string());
                if text.chars().count() <= CAPTION_LIMIT {
                    self.send_photo(&bytes, &file_name, Some(&text)).await?
                } else {
                    tracing::debug!(
                        chars = text.chars().count(),
                        "Caption too long, sending photo and text separately"
                    );
                    self.send_photo(&bytes, &file_name, None).await?;
                    self.send_message(&text).await?
                }
            }
            None => self.send_message(&text).await?,
        };

        let mut status = DeliveryStatus::success_with_message(
            "telegram",
            format!("Delivered to {}", self.config.chat_id),
        );
        if let Some(id) = remote_id {
            status = status.with_remote_id(id);
        }
        Ok(status)
    }

    async fn health_check(&self) -> ChannelResult<bool> {
        match self.call("getMe", |req| req).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Telegram health check failed");
                Ok(false)
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "chat_id": self.config.chat_id,
            "api_base": self.config.api_base,
            "timeout_secs": self.config.timeout_secs,
            "max_retries": self.config.max_retries,
        })
    }
}
