//! Durable publication state
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   check/record   ┌──────────────────────────┐
//! │ DedupEngine  │ ───────────────► │ SharedState (RwLock)     │
//! └──────────────┘                  └────────────┬─────────────┘
//!                                                │ snapshot
//!                                   ┌────────────▼─────────────┐
//!                                   │ StateStore               │
//!                                   │  lock → .tmp → verify →  │
//!                                   │  rename                  │
//!                                   └──────────────────────────┘
//! ```

pub mod dedup;
pub mod lock;
pub mod state;
pub mod store;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

pub use dedup::{
    content_hash, fingerprint, item_content_hash, item_fingerprint, DedupConfig, DedupEngine,
    DedupVerdict, RecordOutcome,
};
pub use lock::{LockConfig, StateLock};
pub use state::{
    MigrationReport, SchemaVersion, State, StateDocumentError, TimestampLog, CURRENT_VERSION,
};
pub use store::{BackupInfo, LoadOutcome, LoadSource, StateStore, StateSummary, StoreConfig};

/// State shared between the orchestrator and supervisor tasks
pub type SharedState = Arc<RwLock<State>>;

/// Wrap a state for sharing
pub fn shared(state: State) -> SharedState {
    Arc::new(RwLock::new(state))
}

/// State persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {}s waiting for lock {}", waited.as_secs(), path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{} failed validation: {source}", path.display())]
    InvalidDocument {
        path: PathBuf,
        #[source]
        source: StateDocumentError,
    },

    #[error("backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    #[error("blocking task failed: {0}")]
    Blocking(String),
}

impl StoreError {
    /// I/O failure for an operation on a path
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether retrying later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Io { .. } | Self::Blocking(_))
    }
}
