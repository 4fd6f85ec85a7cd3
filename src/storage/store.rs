//! Durable state store
//!
//! Loading never fails: a missing file yields fresh state and a corrupt one is
//! backed up and replaced. Saving writes a sibling `.tmp` file under the
//! interprocess lock, re-reads and validates it, then renames it over the
//! live file, so a crash at any point leaves either the old or the new
//! document on disk.
//!
//! # Example
//!
//! ```no_run
//! use herald::storage::{StateStore, StoreConfig};
//!
//! # fn example() -> Result<(), herald::storage::StoreError> {
//! let store = StateStore::new(StoreConfig::new("bot_state.json"));
//! let loaded = store.load();
//! println!("{} entries", loaded.state.sent_entries.len());
//! store.save(&loaded.state)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::lock::{LockConfig, StateLock};
use super::state::{validate_document, MigrationReport, SchemaVersion, State};
use super::{SharedState, StoreError};
use crate::utils::sha256_hex;

const BACKUP_PREFIX: &str = "state_backup_";
const BACKUP_SUFFIX: &str = ".json";

// ============================================================================
// Configuration
// ============================================================================

/// Where and how state is persisted
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Live state file
    pub path: PathBuf,

    /// Directory receiving backups
    pub backup_dir: PathBuf,

    /// Interprocess lock settings
    pub lock: LockConfig,

    /// Backups kept after rotation (0 keeps all)
    pub max_backups: usize,
}

impl StoreConfig {
    /// Config for a state file with backups in `state_backups` next to it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_dir = path
            .parent()
            .map(|p| p.join("state_backups"))
            .unwrap_or_else(|| PathBuf::from("state_backups"));
        Self {
            path,
            backup_dir,
            lock: LockConfig::default(),
            max_backups: 10,
        }
    }

    /// Set the backup directory
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// Set lock behaviour
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set the backup retention count
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }
}

// ============================================================================
// Load Outcome
// ============================================================================

/// How the in-memory state came to be
#[derive(Debug, Clone, PartialEq)]
pub enum LoadSource {
    /// No state file existed
    Fresh,
    /// Loaded from disk, possibly after migration
    Loaded(MigrationReport),
    /// The file was unusable and has been replaced
    Recovered {
        reason: String,
        backup: Option<PathBuf>,
    },
}

/// Result of [`StateStore::load`]
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub state: State,
    pub source: LoadSource,
}

/// A backup file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Summary used by status reporting
#[derive(Debug, Clone)]
pub struct StateSummary {
    pub entries: usize,
    pub hashes: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub version: SchemaVersion,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub backups: usize,
    pub recovery_reason: Option<String>,
}

impl StateSummary {
    /// Summarize a state
    pub fn of(state: &State, backups: usize) -> Self {
        Self {
            entries: state.sent_entries.len(),
            hashes: state.sent_hashes.len(),
            oldest_entry: state.sent_entries.oldest().map(|(_, ts)| ts),
            newest_entry: state.sent_entries.newest().map(|(_, ts)| ts),
            version: state.metadata.version,
            created_at: state.metadata.created_at,
            last_modified: state.metadata.last_modified,
            backups,
            recovery_reason: state.metadata.recovery_reason.clone(),
        }
    }
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_ts = |ts: Option<DateTime<Utc>>| {
            ts.map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        };
        writeln!(f, "Schema version:  {}", self.version)?;
        writeln!(f, "Entries:         {}", self.entries)?;
        writeln!(f, "Content hashes:  {}", self.hashes)?;
        writeln!(f, "Oldest entry:    {}", fmt_ts(self.oldest_entry))?;
        writeln!(f, "Newest entry:    {}", fmt_ts(self.newest_entry))?;
        writeln!(f, "Created:         {}", self.created_at.to_rfc3339())?;
        writeln!(f, "Last modified:   {}", self.last_modified.to_rfc3339())?;
        write!(f, "Backups:         {}", self.backups)?;
        if let Some(reason) = &self.recovery_reason {
            write!(f, "\nRecovered:       {reason}")?;
        }
        Ok(())
    }
}

// ============================================================================
// State Store
// ============================================================================

/// File-backed state persistence
#[derive(Debug, Clone)]
pub struct StateStore {
    config: StoreConfig,
}

impl StateStore {
    /// Create a store
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Live state file
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Backup directory
    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.config.path.with_file_name(name)
    }

    /// Load state from disk, degrading to fresh state on any problem
    pub fn load(&self) -> LoadOutcome {
        let path = &self.config.path;
        let now = Utc::now();

        if !path.exists() {
            tracing::info!(path = %path.display(), "No state file, starting fresh");
            return LoadOutcome {
                state: State::fresh(now),
                source: LoadSource::Fresh,
            };
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => return self.recover(None, format!("state file unreadable: {e}"), now),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return self.recover(Some(&bytes), "state file is empty".to_string(), now);
        }

        let doc: Value = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => return self.recover(Some(&bytes), format!("parse error: {e}"), now),
        };

        match State::from_document(doc, now) {
            Ok((state, report)) => {
                tracing::info!(
                    path = %path.display(),
                    entries = state.sent_entries.len(),
                    hashes = state.sent_hashes.len(),
                    version = %state.metadata.version,
                    "State loaded"
                );
                if report.migrated() {
                    tracing::info!(from = %report.from, to = %report.to, "State migrated");
                }
                LoadOutcome {
                    state,
                    source: LoadSource::Loaded(report),
                }
            }
            Err(e) => self.recover(Some(&bytes), e.to_string(), now),
        }
    }

    fn recover(&self, bytes: Option<&[u8]>, reason: String, now: DateTime<Utc>) -> LoadOutcome {
        tracing::warn!(
            path = %self.config.path.display(),
            reason = %reason,
            "State file unusable, backing up and starting fresh"
        );

        let backup = match bytes {
            Some(bytes) => self.backup_bytes(bytes),
            None => self.backup(),
        };
        let backup = match backup {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(error = %e, "Failed to back up corrupt state file");
                None
            }
        };

        let state = State::recovered(
            now,
            reason.clone(),
            backup.as_ref().map(|p| p.display().to_string()),
        );
        LoadOutcome {
            state,
            source: LoadSource::Recovered { reason, backup },
        }
    }

    /// Atomically persist `state`
    ///
    /// Fails with [`StoreError::LockTimeout`] without touching the live file
    /// when another writer holds the lock.
    pub fn save(&self, state: &State) -> Result<PathBuf, StoreError> {
        let path = &self.config.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create state directory", parent, e))?;
        }

        let _lock = StateLock::acquire(path, &self.config.lock)?;

        let mut snapshot = state.clone();
        snapshot.touch(Utc::now());

        let temp_path = self.temp_path();
        if let Err(e) = self.write_verified(&temp_path, &snapshot) {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                tracing::debug!(error = %cleanup, "No temp file to clean up");
            }
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path) {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                tracing::debug!(error = %cleanup, "No temp file to clean up");
            }
            return Err(StoreError::io("replace state file", path, e));
        }

        tracing::debug!(
            path = %path.display(),
            entries = snapshot.sent_entries.len(),
            "State saved"
        );
        Ok(path.clone())
    }

    fn write_verified(&self, temp_path: &Path, state: &State) -> Result<(), StoreError> {
        let file = File::create(temp_path)
            .map_err(|e| StoreError::io("create temp state file", temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)?;
        writer
            .flush()
            .map_err(|e| StoreError::io("flush temp state file", temp_path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io("flush temp state file", temp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| StoreError::io("sync temp state file", temp_path, e))?;

        let written = fs::read(temp_path)
            .map_err(|e| StoreError::io("re-read temp state file", temp_path, e))?;
        let doc: Value = serde_json::from_slice(&written)?;
        validate_document(&doc).map_err(|source| StoreError::InvalidDocument {
            path: temp_path.to_path_buf(),
            source,
        })
    }

    /// Persist shared state from async code
    ///
    /// Metadata is refreshed in memory first; the file work runs on the
    /// blocking pool.
    pub async fn persist(self: &Arc<Self>, shared: &SharedState) -> Result<PathBuf, StoreError> {
        let snapshot = {
            let mut guard = shared.write().await;
            guard.touch(Utc::now());
            guard.clone()
        };

        let store = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))
            .and_then(|r| r);

        crate::metrics::record_state_save(result.is_ok());
        result
    }

    // ========================================================================
    // Backups
    // ========================================================================

    fn next_backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = &self.config.backup_dir;
        let mut candidate = dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{BACKUP_PREFIX}{stamp}_{n}{BACKUP_SUFFIX}"));
            n += 1;
        }
        candidate
    }

    fn ensure_backup_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.config.backup_dir)
            .map_err(|e| StoreError::io("create backup directory", &self.config.backup_dir, e))
    }

    /// Copy the live file into the backup directory
    pub fn backup(&self) -> Result<PathBuf, StoreError> {
        let source = &self.config.path;
        self.ensure_backup_dir()?;
        let target = self.next_backup_path();
        fs::copy(source, &target).map_err(|e| StoreError::io("copy state to backup", source, e))?;
        tracing::info!(backup = %target.display(), "State backup created");
        self.rotate_backups();
        Ok(target)
    }

    /// Back up raw bytes, reusing an existing backup with identical content
    fn backup_bytes(&self, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let digest = sha256_hex(&[bytes]);
        for existing in self.list_backups()? {
            match fs::read(&existing.path) {
                Ok(content) if sha256_hex(&[&content]) == digest => {
                    tracing::info!(
                        backup = %existing.path.display(),
                        "Corrupt state already backed up"
                    );
                    return Ok(existing.path);
                }
                _ => {}
            }
        }

        self.ensure_backup_dir()?;
        let target = self.next_backup_path();
        fs::write(&target, bytes).map_err(|e| StoreError::io("write backup", &target, e))?;
        tracing::info!(backup = %target.display(), "Corrupt state backed up");
        self.rotate_backups();
        Ok(target)
    }

    /// Backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, StoreError> {
        let dir = &self.config.backup_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("list backups", dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list backups", dir, e))?;
            let path = entry.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(BACKUP_SUFFIX));
            if !is_backup {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            backups.push(BackupInfo {
                path,
                modified,
                size_bytes: meta.len(),
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    fn rotate_backups(&self) {
        if self.config.max_backups == 0 {
            return;
        }
        let backups = match self.list_backups() {
            Ok(backups) => backups,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list backups for rotation");
                return;
            }
        };
        for old in backups.into_iter().skip(self.config.max_backups) {
            match fs::remove_file(&old.path) {
                Ok(()) => tracing::debug!(backup = %old.path.display(), "Rotated out old backup"),
                Err(e) => tracing::warn!(backup = %old.path.display(), error = %e, "Failed to remove old backup"),
            }
        }
    }

    /// Replace the live state with a backup and persist it immediately
    pub fn restore_from_backup(&self, backup: &Path) -> Result<State, StoreError> {
        if !backup.exists() {
            return Err(StoreError::BackupNotFound(backup.to_path_buf()));
        }
        let bytes = fs::read(backup).map_err(|e| StoreError::io("read backup", backup, e))?;
        let doc: Value = serde_json::from_slice(&bytes)?;
        let (mut state, _) =
            State::from_document(doc, Utc::now()).map_err(|source| StoreError::InvalidDocument {
                path: backup.to_path_buf(),
                source,
            })?;

        state.metadata.recovery_reason = None;
        state.metadata.extra.insert(
            "restored_from".to_string(),
            Value::String(backup.display().to_string()),
        );

        self.save(&state)?;
        tracing::info!(
            backup = %backup.display(),
            entries = state.sent_entries.len(),
            "State restored from backup"
        );
        Ok(state)
    }

    /// Summary of `state` including the current backup count
    pub fn summary(&self, state: &State) -> StateSummary {
        let backups = self.list_backups().map(|b| b.len()).unwrap_or(0);
        StateSummary::of(state, backups)
    }
}
