//! Downstream channels receiving publications
//!
//! Every channel implements [`Emitter`]. HTTP channels borrow the shared
//! session, retry transient failures with exponential backoff and never retry
//! a 4xx response other than 429.

pub mod log;
pub mod telegram;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pipeline::Publication;
use crate::supervisor::session::SessionError;

pub use log::LogChannel;
pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookChannel, WebhookConfig};

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur during channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Shared session unavailable
    #[error("Session unavailable: {0}")]
    Session(#[from] SessionError),

    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel temporarily unavailable (5xx)
    #[error("Channel temporarily unavailable: {0}")]
    Unavailable(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Request refused by the remote side (4xx)
    #[error("Rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("Channel error: {0}")]
    Other(String),
}

impl ChannelError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(e) => !e.is_builder() && !e.is_decode(),
            Self::Session(_) | Self::Unavailable(_) | Self::RateLimited(_) => true,
            Self::Rejected { .. }
            | Self::InvalidConfig(_)
            | Self::SerializationError(_)
            | Self::Io(_)
            | Self::Other(_) => false,
        }
    }

    /// Whether the shared session should be rebuilt
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::HttpError(e) if e.is_connect() || e.is_request())
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited(body)
        } else if status.is_client_error() {
            Self::Rejected {
                status: status.as_u16(),
                body,
            }
        } else {
            Self::Unavailable(format!("HTTP {status}: {body}"))
        }
    }
}

/// Response from emitting a publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    /// Whether the publication was acknowledged
    pub success: bool,
    /// Channel that delivered (or failed to deliver) the publication
    pub channel: String,
    /// Optional message about the delivery
    pub message: Option<String>,
    /// Remote identifier, when the channel returns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Timestamp of delivery attempt
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DeliveryStatus {
    /// Create a successful delivery status
    pub fn success(channel: impl Into<String>) -> Self {
        Self {
            success: true,
            channel: channel.into(),
            message: None,
            remote_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a successful delivery status with a message
    pub fn success_with_message(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(channel)
        }
    }

    /// Create a failed delivery status
    pub fn failure(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::success(channel)
        }
    }

    /// Attach the remote identifier
    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "SUCCESS" } else { "FAILED" };
        write!(f, "[{status}] {}", self.channel)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// A downstream destination for publications
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Emit one publication
    ///
    /// `Ok` with `success == false` and `Err` are both treated as "not
    /// published"; the item will be offered again next cycle.
    async fn emit(&self, publication: &Publication) -> ChannelResult<DeliveryStatus>;

    /// Check if the channel is reachable
    async fn health_check(&self) -> ChannelResult<bool> {
        Ok(true)
    }

    /// Channel configuration as JSON, secrets omitted
    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
        })
    }
}
