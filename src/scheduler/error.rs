//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Unknown publication mode name
    InvalidMode { mode: String },

    /// Slot string that is not `H:MM` or `H:MM:SS`
    InvalidSlot { input: String, reason: String },

    /// Minimum interval outside the accepted range
    InvalidInterval { seconds: i64 },

    /// UTC offset outside ±23:59 or badly formatted
    InvalidUtcOffset { offset: String },

    /// A computed instant fell outside the representable range
    TimeOutOfRange { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMode { mode } => {
                write!(
                    f,
                    "Invalid publication mode '{}'. Valid options: pacing, fixed_slots",
                    mode
                )
            }
            Self::InvalidSlot { input, reason } => {
                write!(f, "Invalid slot '{}': {}", input, reason)
            }
            Self::InvalidInterval { seconds } => {
                write!(f, "Invalid minimum interval {}s. Must be positive", seconds)
            }
            Self::InvalidUtcOffset { offset } => {
                write!(f, "Invalid UTC offset '{}'. Expected +HH:MM or -HH:MM", offset)
            }
            Self::TimeOutOfRange { reason } => {
                write!(f, "Time out of range: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create an invalid mode error
    pub fn invalid_mode(mode: impl Into<String>) -> Self {
        Self::InvalidMode { mode: mode.into() }
    }

    /// Create an invalid slot error
    pub fn invalid_slot(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSlot {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid UTC offset error
    pub fn invalid_utc_offset(offset: impl Into<String>) -> Self {
        Self::InvalidUtcOffset {
            offset: offset.into(),
        }
    }

    /// Create a time range error
    pub fn out_of_range(reason: impl Into<String>) -> Self {
        Self::TimeOutOfRange {
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    ///
    /// Every scheduler error is a configuration problem; the previous
    /// schedule stays in effect.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TimeOutOfRange { .. })
    }
}
