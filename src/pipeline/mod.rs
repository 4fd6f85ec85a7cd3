//! Publication pipeline
//!
//! # Architecture
//!
//! ```text
//! FeedSource ─► DedupEngine ─► PublicationScheduler ─► Enhancer ─► MediaSource ─► Emitter
//!                   ▲                                                               │
//!                   └──────────────── record + persist on success ◄─────────────────┘
//! ```
//!
//! [`Orchestrator`] drives one cycle at a time; [`RunStats`] accumulates the
//! counters written into the persisted `stats` section.

pub mod orchestrator;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use orchestrator::{CycleReport, ItemOutcome, Orchestrator, OrchestratorConfig};
pub use stats::RunStats;

/// An item offered by a feed, not yet published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Canonical link; identity bearing
    pub link: String,

    pub title: String,

    pub description: String,

    /// Image referenced by the feed, possibly relative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Feed the item came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CandidateItem {
    pub fn new(
        link: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            link: link.into(),
            title: title.into(),
            description: description.into(),
            image_url: None,
            source: None,
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Items without a link cannot be fingerprinted and are dropped
    pub fn has_link(&self) -> bool {
        !self.link.trim().is_empty()
    }
}

/// Final content handed to an emitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub fingerprint: String,
    pub title: String,
    pub description: String,
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}
