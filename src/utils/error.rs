//! Error types shared by the HTTP collaborators
//!
//! Feed retrieval and media download both go through the shared session and
//! fail in the same ways, so they share one error type.

use thiserror::Error;

use crate::supervisor::session::SessionError;

/// Errors that can occur while fetching remote resources
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Shared session could not be acquired
    #[error("Session unavailable: {0}")]
    Session(#[from] SessionError),

    /// Server answered with a non-success status code
    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Response body could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Response rejected by a content check (type, size)
    #[error("Rejected content: {0}")]
    Rejected(String),

    /// Local file system error while storing the response
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every configured source failed
    #[error("All {0} feeds failed")]
    AllSourcesFailed(usize),
}

impl FetchError {
    /// Check if the error is transient and worth retrying on the next cycle
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Session(_) | Self::Timeout | Self::AllSourcesFailed(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Io(_) => true,
            Self::Decode(_) | Self::InvalidUrl(_) | Self::Rejected(_) => false,
        }
    }

    /// Whether the failure points at a broken connection pool
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_request(),
            Self::Session(_) => true,
            _ => false,
        }
    }

    /// Map a reqwest error, folding timeouts into [`FetchError::Timeout`]
    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}
