//! Run statistics
//!
//! Counters survive restarts by living in the persisted `stats` section.
//! Keys written by other components (cleanup results, for one) are left
//! alone.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Pipeline counters and cycle timings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub posts_sent: u64,
    pub duplicates_rejected: u64,
    pub posts_skipped: u64,
    pub errors: u64,
    pub last_post: Option<DateTime<Utc>>,
    /// Emissions per hour of day, keyed `hour_<H>`
    pub hourly_stats: BTreeMap<String, u64>,
    pub cycles_completed: u64,
    /// Seconds
    pub total_processing_time: f64,
    pub avg_processing_time: f64,
    pub max_cycle_time: f64,
    pub min_cycle_time: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Read counters back from a persisted stats section
    ///
    /// Malformed values fall back to zero rather than failing startup.
    pub fn from_stats(stats: &Map<String, Value>) -> Self {
        match serde_json::from_value(Value::Object(stats.clone())) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted stats unreadable, starting from zero");
                Self::default()
            }
        }
    }

    /// Write counters into a stats section, keeping foreign keys
    pub fn write_into(&self, stats: &mut Map<String, Value>) {
        if let Ok(Value::Object(own)) = serde_json::to_value(self) {
            for (key, value) in own {
                stats.insert(key, value);
            }
        }
    }

    pub fn record_post(&mut self, at: DateTime<Utc>) {
        self.posts_sent += 1;
        self.last_post = Some(at);
        *self
            .hourly_stats
            .entry(format!("hour_{}", at.hour()))
            .or_insert(0) += 1;
    }

    pub fn record_cycle(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.cycles_completed += 1;
        self.total_processing_time += secs;
        self.avg_processing_time = self.total_processing_time / self.cycles_completed as f64;
        self.max_cycle_time = self.max_cycle_time.max(secs);
        self.min_cycle_time = Some(self.min_cycle_time.map_or(secs, |m| m.min(secs)));
    }
}
