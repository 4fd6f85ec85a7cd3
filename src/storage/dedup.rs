//! Deduplication over the shared publication state
//!
//! Two keys are tracked per emitted item:
//! - the fingerprint, SHA-256 over `link` and `title` joined by U+001F
//! - the content hash, SHA-256 over `title` followed by `description`
//!
//! Both live in the in-memory [`State`] behind [`SharedState`], so membership
//! tests are O(1) and survive restarts once the state is persisted.

use chrono::{DateTime, Utc};

use super::state::State;
use super::SharedState;
use crate::pipeline::CandidateItem;
use crate::utils::sha256_hex;

/// Separator placed between fingerprint fields
const FIELD_SEPARATOR: &[u8] = "\u{1f}".as_bytes();

// ============================================================================
// Configuration
// ============================================================================

/// Deduplication configuration
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Entries kept after eviction
    pub max_entries: usize,

    /// Reject items whose content hash was already emitted under another link
    pub reject_duplicate_content: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            reject_duplicate_content: true,
        }
    }
}

impl DedupConfig {
    /// Set the retained entry count
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Toggle content-hash rejection
    pub fn with_content_rejection(mut self, enabled: bool) -> Self {
        self.reject_duplicate_content = enabled;
        self
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Identity of an item: SHA-256 over `link` and `title`
pub fn fingerprint(link: &str, title: &str) -> String {
    sha256_hex(&[link.as_bytes(), FIELD_SEPARATOR, title.as_bytes()])
}

/// Content identity: SHA-256 over `title` immediately followed by `description`
pub fn content_hash(title: &str, description: &str) -> String {
    sha256_hex(&[title.as_bytes(), description.as_bytes()])
}

/// Fingerprint of a candidate
pub fn item_fingerprint(item: &CandidateItem) -> String {
    fingerprint(&item.link, &item.title)
}

/// Content hash of a candidate
pub fn item_content_hash(item: &CandidateItem) -> String {
    content_hash(&item.title, &item.description)
}

// ============================================================================
// Verdicts
// ============================================================================

/// Result of checking a candidate against history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// Never emitted
    New { fingerprint: String },
    /// Same link and title already emitted
    DuplicateFingerprint { fingerprint: String },
    /// Same title and description already emitted under a different identity
    DuplicateContent { fingerprint: String, hash: String },
}

impl DedupVerdict {
    /// Whether the candidate may be published
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New { .. })
    }

    /// Fingerprint the verdict was computed for
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::New { fingerprint }
            | Self::DuplicateFingerprint { fingerprint }
            | Self::DuplicateContent { fingerprint, .. } => fingerprint,
        }
    }

    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::DuplicateFingerprint { .. } => "fingerprint",
            Self::DuplicateContent { .. } => "content",
        }
    }
}

/// What a [`DedupEngine::record`] call changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub fingerprint: String,
    pub content_hash: String,
    pub evicted_entries: usize,
    pub evicted_hashes: usize,
}

// ============================================================================
// Eviction
// ============================================================================

/// Trim history once it grows past `max_entries × 1.2`
///
/// Oldest entries go first until `max_entries` remain. Hashes stamped strictly
/// before the oldest surviving entry are then removed in insertion order,
/// at most as many as entries were evicted. Returns `(entries, hashes)`
/// removed.
pub fn evict(state: &mut State, max_entries: usize) -> (usize, usize) {
    let len = state.sent_entries.len();
    if len * 5 <= max_entries * 6 {
        return (0, 0);
    }

    let mut removed = 0;
    while state.sent_entries.len() > max_entries {
        if state.sent_entries.pop_oldest().is_none() {
            break;
        }
        removed += 1;
    }

    let cutoff = state.sent_entries.iter().map(|(_, ts)| ts).min();
    let hashes_removed = match cutoff {
        Some(cutoff) => state.sent_hashes.remove_older_than(cutoff, removed),
        None => state.sent_hashes.remove_older_than(DateTime::<Utc>::MAX_UTC, removed),
    };

    tracing::info!(
        entries_removed = removed,
        hashes_removed = hashes_removed,
        remaining = state.sent_entries.len(),
        "Evicted old dedup history"
    );
    (removed, hashes_removed)
}

// ============================================================================
// Engine
// ============================================================================

/// Membership tests and recording against shared state
#[derive(Debug, Clone)]
pub struct DedupEngine {
    state: SharedState,
    config: DedupConfig,
}

impl DedupEngine {
    /// Create an engine over shared state
    pub fn new(state: SharedState, config: DedupConfig) -> Self {
        Self { state, config }
    }

    /// Engine configuration
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// State the engine reads and writes
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Whether a fingerprint was already emitted
    pub async fn is_duplicate(&self, fingerprint: &str) -> bool {
        self.state.read().await.sent_entries.contains(fingerprint)
    }

    /// Whether a content hash was already emitted
    pub async fn is_duplicate_content(&self, hash: &str) -> bool {
        self.state.read().await.sent_hashes.contains(hash)
    }

    /// Classify a candidate
    pub async fn check(&self, item: &CandidateItem) -> DedupVerdict {
        let fingerprint = item_fingerprint(item);
        let state = self.state.read().await;

        if state.sent_entries.contains(&fingerprint) {
            return DedupVerdict::DuplicateFingerprint { fingerprint };
        }

        if self.config.reject_duplicate_content {
            let hash = item_content_hash(item);
            if state.sent_hashes.contains(&hash) {
                return DedupVerdict::DuplicateContent { fingerprint, hash };
            }
        }

        DedupVerdict::New { fingerprint }
    }

    /// Record a candidate as emitted now
    pub async fn record(&self, item: &CandidateItem) -> RecordOutcome {
        self.record_at(item, Utc::now()).await
    }

    /// Record a candidate as emitted at `ts`
    pub async fn record_at(&self, item: &CandidateItem, ts: DateTime<Utc>) -> RecordOutcome {
        let fingerprint = item_fingerprint(item);
        let content_hash = item_content_hash(item);

        let mut state = self.state.write().await;
        state.sent_entries.insert(fingerprint.clone(), ts);
        state.sent_hashes.insert(content_hash.clone(), ts);
        let (evicted_entries, evicted_hashes) = evict(&mut state, self.config.max_entries);

        tracing::debug!(
            fingerprint = %fingerprint,
            entries = state.sent_entries.len(),
            "Recorded emission"
        );

        RecordOutcome {
            fingerprint,
            content_hash,
            evicted_entries,
            evicted_hashes,
        }
    }
}
