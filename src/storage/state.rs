//! Persisted publication state
//!
//! The state document has four sections:
//!
//! - `sent_entries` - fingerprint → emission timestamp, insertion ordered
//! - `sent_hashes` - content hash → emission timestamp, insertion ordered
//! - `stats` - free-form counters written by the pipeline and supervisor
//! - `metadata` - schema version, timestamps and recovery provenance
//!
//! Raw documents go through [`migrate_document`] and [`validate_document`]
//! before they are turned into a typed [`State`]. Migrations are keyed by the
//! schema version they upgrade to and run in increasing order.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::OnceLock;

/// Names of the sections every state document must carry
pub const REQUIRED_SECTIONS: [&str; 4] = ["sent_entries", "sent_hashes", "stats", "metadata"];

/// Schema version written by this build
pub const CURRENT_VERSION: SchemaVersion = SchemaVersion::new(1, 4);

// ============================================================================
// Schema Version
// ============================================================================

/// `major.minor` schema version, persisted as a JSON number (`1.4`)
///
/// Minor versions are single digit, matching the documents already in the
/// wild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
}

impl SchemaVersion {
    /// Create a version
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Version assumed for documents that carry none
    pub const fn legacy() -> Self {
        Self::new(1, 0)
    }

    /// Parse from a JSON number or numeric string
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().and_then(Self::from_f64),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(Self::from_f64),
            _ => None,
        }
    }

    fn from_f64(v: f64) -> Option<Self> {
        if !v.is_finite() || v < 0.0 || v > f64::from(u16::MAX) {
            return None;
        }
        let major = v.trunc();
        let minor = ((v - major) * 10.0).round();
        Some(Self::new(major as u16, minor as u16))
    }

    /// Numeric representation
    pub fn as_f64(&self) -> f64 {
        f64::from(self.major) + f64::from(self.minor) / 10.0
    }

    /// JSON representation
    pub fn to_value(&self) -> Value {
        serde_json::Number::from_f64(self.as_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| de::Error::custom(format!("invalid schema version: {value}")))
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Render a timestamp the way state documents store it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
///
/// Accepts RFC 3339 and the naive ISO-8601 form older documents used (read as
/// UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_timestamp_or_epoch(raw: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        tracing::warn!(timestamp = %raw, "Unparseable timestamp in state, treating as oldest");
        DateTime::<Utc>::default()
    })
}

mod lenient_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(parse_timestamp_or_epoch(&raw))
    }
}

// ============================================================================
// Timestamp Log
// ============================================================================

/// Insertion-ordered map of key → timestamp
///
/// Re-inserting an existing key updates its timestamp in place and keeps its
/// position, so eviction order is first-insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimestampLog {
    order: VecDeque<String>,
    stamps: HashMap<String, DateTime<Utc>>,
}

impl TimestampLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Membership test
    pub fn contains(&self, key: &str) -> bool {
        self.stamps.contains_key(key)
    }

    /// Timestamp recorded for a key
    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.stamps.get(key).copied()
    }

    /// Insert or update a key; returns `true` when the key is new
    pub fn insert(&mut self, key: impl Into<String>, ts: DateTime<Utc>) -> bool {
        let key = key.into();
        match self.stamps.insert(key.clone(), ts) {
            Some(_) => false,
            None => {
                self.order.push_back(key);
                true
            }
        }
    }

    /// Remove and return the oldest key
    pub fn pop_oldest(&mut self) -> Option<(String, DateTime<Utc>)> {
        let key = self.order.pop_front()?;
        let ts = self.stamps.remove(&key).unwrap_or_default();
        Some((key, ts))
    }

    /// Oldest key by insertion order
    pub fn oldest(&self) -> Option<(&str, DateTime<Utc>)> {
        let key = self.order.front()?;
        self.stamps.get(key).map(|ts| (key.as_str(), *ts))
    }

    /// Newest key by insertion order
    pub fn newest(&self) -> Option<(&str, DateTime<Utc>)> {
        let key = self.order.back()?;
        self.stamps.get(key).map(|ts| (key.as_str(), *ts))
    }

    /// Remove up to `limit` keys stamped strictly before `cutoff`
    ///
    /// Candidates are taken in insertion order. Returns the number removed.
    pub fn remove_older_than(&mut self, cutoff: DateTime<Utc>, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }

        let doomed: HashSet<String> = self
            .order
            .iter()
            .filter(|key| self.stamps.get(*key).is_some_and(|ts| *ts < cutoff))
            .take(limit)
            .cloned()
            .collect();

        if doomed.is_empty() {
            return 0;
        }

        self.order.retain(|key| !doomed.contains(key));
        for key in &doomed {
            self.stamps.remove(key);
        }
        doomed.len()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.stamps.get(key).map(|ts| (key.as_str(), *ts)))
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }
}

impl Serialize for TimestampLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, ts) in self.iter() {
            map.serialize_entry(key, &format_timestamp(&ts))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TimestampLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LogVisitor;

        impl<'de> Visitor<'de> for LogVisitor {
            type Value = TimestampLog;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of key to timestamp string")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut log = TimestampLog::new();
                while let Some((key, raw)) = access.next_entry::<String, String>()? {
                    log.insert(key, parse_timestamp_or_epoch(&raw));
                }
                Ok(log)
            }
        }

        deserializer.deserialize_map(LogVisitor)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Bookkeeping carried alongside the dedup history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Schema version of the document
    pub version: SchemaVersion,

    /// When this state was first created
    #[serde(with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,

    /// Last successful save
    #[serde(with = "lenient_timestamp")]
    pub last_modified: DateTime<Utc>,

    /// Set once the state has been through a full startup
    #[serde(default)]
    pub initialized: bool,

    /// Why a fresh state replaced the previous one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_reason: Option<String>,

    /// Backup holding the replaced document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<String>,

    /// Set when the document was upgraded from the list-based layout
    #[serde(default)]
    pub converted_from_legacy: bool,

    /// Entry count at last save
    #[serde(default)]
    pub entries_count: usize,

    /// Hash count at last save
    #[serde(default)]
    pub hashes_count: usize,

    /// Fields written by newer builds, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            version: CURRENT_VERSION,
            created_at: now,
            last_modified: now,
            initialized: true,
            recovery_reason: None,
            backup_file: None,
            converted_from_legacy: false,
            entries_count: 0,
            hashes_count: 0,
            extra: Map::new(),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Typed state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Emitted fingerprints
    pub sent_entries: TimestampLog,

    /// Emitted content hashes
    pub sent_hashes: TimestampLog,

    /// Free-form statistics
    #[serde(default)]
    pub stats: Map<String, Value>,

    /// Document metadata
    pub metadata: Metadata,
}

impl State {
    /// Empty state at the current schema version
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            sent_entries: TimestampLog::new(),
            sent_hashes: TimestampLog::new(),
            stats: Map::new(),
            metadata: Metadata::fresh(now),
        }
    }

    /// Empty state annotated with why the previous one was discarded
    pub fn recovered(now: DateTime<Utc>, reason: impl Into<String>, backup: Option<String>) -> Self {
        let mut state = Self::fresh(now);
        state.metadata.recovery_reason = Some(reason.into());
        state.metadata.backup_file = backup;
        state
    }

    /// Update counters and modification time before a save
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.last_modified = now;
        self.metadata.entries_count = self.sent_entries.len();
        self.metadata.hashes_count = self.sent_hashes.len();
    }

    /// Build from a raw document, running migrations and validation
    pub fn from_document(doc: Value, now: DateTime<Utc>) -> Result<(Self, MigrationReport), StateDocumentError> {
        let (doc, report) = migrate_document(doc, now);
        validate_document(&doc)?;
        let state = serde_json::from_value(doc)
            .map_err(|e| StateDocumentError::new(vec![format!("malformed document: {e}")]))?;
        Ok((state, report))
    }

    /// Merge values into the stats section
    pub fn merge_stats(&mut self, updates: Map<String, Value>) {
        for (key, value) in updates {
            self.stats.insert(key, value);
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Reasons a document was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDocumentError {
    pub issues: Vec<String>,
}

impl StateDocumentError {
    fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }
}

impl fmt::Display for StateDocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state document: {}", self.issues.join("; "))
    }
}

impl std::error::Error for StateDocumentError {}

fn hash_key_re() -> Option<&'static Regex> {
    static HASH_RE: OnceLock<Option<Regex>> = OnceLock::new();
    HASH_RE.get_or_init(|| Regex::new(r"^[a-f0-9]{64}$").ok()).as_ref()
}

/// Whether a key is a well-formed content hash
pub fn is_valid_hash_key(key: &str) -> bool {
    match hash_key_re() {
        Some(re) => re.is_match(key),
        None => key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')),
    }
}

/// Structural validation of a raw state document
///
/// Collects every issue instead of stopping at the first one so the recovery
/// log is useful.
pub fn validate_document(doc: &Value) -> Result<(), StateDocumentError> {
    let Some(root) = doc.as_object() else {
        return Err(StateDocumentError::new(vec![
            "state document is not an object".to_string(),
        ]));
    };

    let mut issues = Vec::new();

    for section in REQUIRED_SECTIONS {
        match root.get(section) {
            None => issues.push(format!("missing section '{section}'")),
            Some(value) if !value.is_object() => {
                issues.push(format!("section '{section}' must be an object"))
            }
            Some(_) => {}
        }
    }

    if let Some(entries) = root.get("sent_entries").and_then(Value::as_object) {
        for (key, value) in entries {
            if key.trim().is_empty() {
                issues.push("empty fingerprint key in 'sent_entries'".to_string());
            }
            if !value.is_string() {
                issues.push(format!("entry '{key}' has a non-string timestamp"));
            }
        }
    }

    if let Some(hashes) = root.get("sent_hashes").and_then(Value::as_object) {
        for (key, value) in hashes {
            if !is_valid_hash_key(key) {
                issues.push(format!("malformed hash key '{key}'"));
            }
            if !value.is_string() {
                issues.push(format!("hash '{key}' has a non-string timestamp"));
            }
        }
    }

    if let Some(metadata) = root.get("metadata").and_then(Value::as_object) {
        match metadata.get("version") {
            Some(Value::Number(_)) => {}
            Some(other) => issues.push(format!("metadata.version must be numeric, got {other}")),
            None => issues.push("metadata.version is missing".to_string()),
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(StateDocumentError::new(issues))
    }
}

// ============================================================================
// Migration
// ============================================================================

type MigrationStep = fn(&mut Map<String, Value>, DateTime<Utc>);

/// Upgrade steps keyed by the version they produce, in increasing order
const MIGRATIONS: &[(SchemaVersion, &str, MigrationStep)] = &[
    (
        SchemaVersion::new(1, 1),
        "convert legacy record lists to maps",
        convert_legacy_lists,
    ),
    (
        SchemaVersion::new(1, 4),
        "fill metadata defaults",
        fill_metadata_defaults,
    ),
];

/// Outcome of [`migrate_document`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version found in the document
    pub from: SchemaVersion,
    /// Version after migration
    pub to: SchemaVersion,
    /// Names of the steps that ran
    pub applied: Vec<&'static str>,
}

impl MigrationReport {
    /// Whether anything changed
    pub fn migrated(&self) -> bool {
        self.from != self.to
    }
}

/// Version recorded in a raw document (legacy when absent)
pub fn document_version(root: &Map<String, Value>) -> SchemaVersion {
    root.get("metadata")
        .and_then(|m| m.get("version"))
        .and_then(SchemaVersion::from_value)
        .unwrap_or_else(SchemaVersion::legacy)
}

/// Bring a raw document up to [`CURRENT_VERSION`]
///
/// Idempotent: a current document passes through unchanged. Documents from a
/// newer schema are never downgraded.
pub fn migrate_document(doc: Value, now: DateTime<Utc>) -> (Value, MigrationReport) {
    let mut root = match doc {
        Value::Object(root) => root,
        other => {
            let report = MigrationReport {
                from: SchemaVersion::legacy(),
                to: SchemaVersion::legacy(),
                applied: Vec::new(),
            };
            return (other, report);
        }
    };

    let from = document_version(&root);
    let mut report = MigrationReport {
        from,
        to: from,
        applied: Vec::new(),
    };

    if from >= CURRENT_VERSION {
        if from > CURRENT_VERSION {
            tracing::warn!(
                found = %from,
                supported = %CURRENT_VERSION,
                "State written by a newer schema, loading without migration"
            );
        }
        return (Value::Object(root), report);
    }

    let mut version = from;
    for (target, name, step) in MIGRATIONS {
        if version < *target {
            step(&mut root, now);
            version = *target;
            report.applied.push(*name);
            tracing::info!(to = %target, step = *name, "Migrated state document");
        }
    }
    if version < CURRENT_VERSION {
        version = CURRENT_VERSION;
    }

    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("version".to_string(), version.to_value());
        report.to = version;
    }

    (Value::Object(root), report)
}

fn convert_legacy_lists(root: &mut Map<String, Value>, now: DateTime<Utc>) {
    let stamp = Value::String(format_timestamp(&now));

    let legacy_entries = match root.get("sent_entries") {
        Some(Value::Array(items)) => Some(items.clone()),
        _ => None,
    };

    let Some(items) = legacy_entries else {
        return;
    };

    let mut entries = Map::new();
    for item in items {
        match item {
            Value::Object(record) => {
                let Some(id) = record.get("post_id").and_then(Value::as_str) else {
                    continue;
                };
                if id.trim().is_empty() {
                    continue;
                }
                let ts = record
                    .get("pub_date")
                    .and_then(Value::as_str)
                    .map(|s| Value::String(s.to_string()))
                    .unwrap_or_else(|| stamp.clone());
                entries.insert(id.to_string(), ts);
            }
            Value::String(id) if !id.trim().is_empty() => {
                entries.insert(id, stamp.clone());
            }
            _ => {}
        }
    }
    root.insert("sent_entries".to_string(), Value::Object(entries));

    let mut hashes = match root.remove("sent_hashes") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    if let Some(Value::Array(legacy)) = root.remove("entry_hashes") {
        for hash in legacy.iter().filter_map(Value::as_str) {
            hashes
                .entry(hash.to_string())
                .or_insert_with(|| stamp.clone());
        }
    }
    root.insert("sent_hashes".to_string(), Value::Object(hashes));

    if !root.get("stats").is_some_and(Value::is_object) {
        root.insert("stats".to_string(), Value::Object(Map::new()));
    }

    let metadata = root
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(metadata) = metadata.as_object_mut() {
        metadata.insert("converted_from_legacy".to_string(), Value::Bool(true));
        metadata.insert("version".to_string(), SchemaVersion::new(1, 1).to_value());
    }
}

fn fill_metadata_defaults(root: &mut Map<String, Value>, now: DateTime<Utc>) {
    let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let stamp = Value::String(format_timestamp(&now));
    metadata
        .entry("created_at".to_string())
        .or_insert_with(|| stamp.clone());
    metadata
        .entry("last_modified".to_string())
        .or_insert_with(|| stamp.clone());
    metadata
        .entry("initialized".to_string())
        .or_insert(Value::Bool(true));
}
