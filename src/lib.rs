//! herald - feed-to-channel publication engine
//!
//! Polls feeds for candidate items, rejects anything already published,
//! spaces emissions according to a pacing or fixed-slot schedule, and keeps
//! the shared HTTP session, background tasks and media files healthy over
//! long runs.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`storage`] - Durable state file, dedup history and backups
//! - [`scheduler`] - Pacing and fixed-slot publication timing
//! - [`supervisor`] - Session refresh, task reaping and artifact cleanup
//! - [`pipeline`] - The fetch, filter, wait, emit, record driver
//! - [`feed`], [`enhance`], [`media`], [`channels`] - Pipeline collaborators
//! - [`metrics`] - Prometheus counters and histograms
//! - [`utils`] - Common utilities and helpers
//!
//! ```text
//!  FeedSource ──► DedupEngine ──► PublicationScheduler ──► Enhancer
//!                     │                                       │
//!                     ▼                                       ▼
//!                StateStore ◄──────── Emitter ◄──────── MediaSource
//! ```
//!
//! # Example
//!
//! ```no_run
//! use herald::config::Config;
//! use herald::storage::StateStore;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     let store = StateStore::new(config.state.store_config());
//!     let outcome = store.load();
//!     println!("{}", store.summary(&outcome.state));
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod config;
pub mod enhance;
pub mod error;
pub mod feed;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::channels::{DeliveryStatus, Emitter};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, HeraldErrorTrait, Result};
    pub use crate::pipeline::{CandidateItem, Orchestrator, Publication};
    pub use crate::scheduler::{PublicationMode, PublicationScheduler, ScheduleSettings};
    pub use crate::storage::{DedupEngine, State, StateStore};
    pub use crate::supervisor::{SessionHandle, Supervisor, TaskRegistry};
}

// Direct re-exports for convenience
pub use pipeline::{CandidateItem, Publication};
