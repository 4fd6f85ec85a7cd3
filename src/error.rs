//! Unified error handling for the herald crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`HeraldErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use herald::error::{Error, HeraldErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying: {}", err.describe());
//!     } else {
//!         eprintln!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::channels::ChannelError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StoreError;
pub use crate::supervisor::SessionError;
pub use crate::utils::error::FetchError;

/// Common trait for herald error types
pub trait HeraldErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Short operator-facing description
    fn describe(&self) -> String;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, session)
    Network,
    /// Feed or response decoding errors
    Parsing,
    /// State file and I/O errors
    Storage,
    /// Downstream channel errors
    Channel,
    /// Configuration and validation errors
    Config,
    /// Scheduler and timing errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parsing => "parsing",
            Self::Storage => "storage",
            Self::Channel => "channel",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the herald crate
#[derive(Error, Debug)]
pub enum Error {
    /// Feed and media fetch errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// State persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Channel delivery errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// HTTP session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HeraldErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Channel(e) => e.is_retryable(),
            Self::Session(_) => true,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn describe(&self) -> String {
        format!("{}: {self}", self.category().as_str())
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(FetchError::Decode(_)) => ErrorCategory::Parsing,
            Self::Fetch(_) | Self::Session(_) | Self::Http(_) => ErrorCategory::Network,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Channel(ChannelError::InvalidConfig(_)) => ErrorCategory::Config,
            Self::Channel(_) => ErrorCategory::Channel,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
