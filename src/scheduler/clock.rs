//! Wall-clock sources for scheduling decisions

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Debug;

/// Source of the current instant
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by tokio's clock
///
/// Anchored to a wall-clock instant and advanced by `tokio::time::Instant`,
/// so it follows `tokio::time::pause` and `advance` in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor at the current wall time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at the given wall time
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.anchor.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall + elapsed
    }
}
