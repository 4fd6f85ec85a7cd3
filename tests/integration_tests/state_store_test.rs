//! State store integration tests
//!
//! Exercises the file-level guarantees:
//! 1. Legacy documents migrate on load
//! 2. Corrupt files are preserved once and replaced by fresh state
//! 3. Interrupted writes never damage the live file
//! 4. Backups rotate and restore

use chrono::Utc;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use herald::storage::{
    shared, DedupConfig, DedupEngine, LoadSource, LockConfig, State, StateLock, StateStore,
    StoreConfig, StoreError, CURRENT_VERSION,
};

use super::fixtures::{CORRUPT_STATE, LEGACY_STATE};
use crate::common::{candidate, store_in};

// ============================================================================
// Load and Migration
// ============================================================================

#[test]
fn test_legacy_document_is_migrated() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    fs::write(store.path(), LEGACY_STATE).unwrap();

    let outcome = store.load();
    let LoadSource::Loaded(report) = &outcome.source else {
        panic!("expected a migrated load, got {:?}", outcome.source);
    };
    assert!(report.migrated());
    assert_eq!(report.to, CURRENT_VERSION);

    let state = outcome.state;
    assert!(state.sent_entries.contains("legacy-one"));
    assert!(state.sent_entries.contains("legacy-two"));
    assert_eq!(state.sent_hashes.len(), 1);
    assert_eq!(state.stats.get("posts_sent"), Some(&serde_json::json!(7)));
}

#[test]
fn test_migrated_state_round_trips_without_further_migration() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    fs::write(store.path(), LEGACY_STATE).unwrap();

    let first = store.load();
    store.save(&first.state).unwrap();

    let second = store.load();
    let LoadSource::Loaded(report) = &second.source else {
        panic!("expected a clean load");
    };
    assert!(!report.migrated());
    assert_eq!(second.state.sent_entries.len(), 2);
}

#[test]
fn test_corrupt_state_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    fs::write(store.path(), CORRUPT_STATE).unwrap();

    let first = store.load();
    let second = store.load();

    assert!(matches!(first.source, LoadSource::Recovered { .. }));
    assert!(matches!(second.source, LoadSource::Recovered { .. }));
    assert!(first.state.sent_entries.is_empty());
    assert!(second.state.sent_entries.is_empty());

    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 1, "identical corrupt bytes are backed up once");
    assert_eq!(fs::read_to_string(&backups[0].path).unwrap(), CORRUPT_STATE);
}

// ============================================================================
// Atomic Persistence
// ============================================================================

#[test]
fn test_stale_temp_file_does_not_corrupt_live_state() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());

    let mut state = State::fresh(Utc::now());
    state.sent_entries.insert("kept", Utc::now());
    store.save(&state).unwrap();

    // Leftover from a crash mid-write
    fs::write(dir.path().join("state.json.tmp"), "{ half written").unwrap();

    let outcome = store.load();
    assert!(matches!(outcome.source, LoadSource::Loaded(_)));
    assert!(outcome.state.sent_entries.contains("kept"));

    state.sent_entries.insert("second", Utc::now());
    store.save(&state).unwrap();
    assert_eq!(store.load().state.sent_entries.len(), 2);
}

#[test]
fn test_save_under_held_lock_fails_and_keeps_prior_bytes() {
    let dir = TempDir::new().unwrap();
    let lock = LockConfig {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        stale_after: Duration::from_secs(3600),
    };
    let store = StateStore::new(StoreConfig::new(dir.path().join("state.json")).with_lock(lock));
    store.save(&State::fresh(Utc::now())).unwrap();
    let before = fs::read(store.path()).unwrap();

    let _held = StateLock::acquire(store.path(), &lock).unwrap();

    let mut state = State::fresh(Utc::now());
    state.sent_entries.insert("blocked", Utc::now());
    let err = store.save(&state).unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout { .. }));
    assert_eq!(fs::read(store.path()).unwrap(), before);
}

#[tokio::test]
async fn test_emitted_items_survive_reload() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());

    {
        let state = shared(store.load().state);
        let dedup = DedupEngine::new(state.clone(), DedupConfig::default());
        dedup.record(&candidate(1)).await;
        store.persist(&state).await.unwrap();
    }

    let state = shared(store.load().state);
    let dedup = DedupEngine::new(state, DedupConfig::default());
    assert!(!dedup.check(&candidate(1)).await.is_new());
    assert!(dedup.check(&candidate(2)).await.is_new());
}

#[tokio::test]
async fn test_eviction_scenario_keeps_newest_three() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    let state = shared(State::fresh(Utc::now()));
    let dedup = DedupEngine::new(state.clone(), DedupConfig::default().with_max_entries(3));

    let base = Utc::now();
    for n in 0..5 {
        dedup
            .record_at(&candidate(n), base + chrono::TimeDelta::seconds(n as i64))
            .await;
        let len = state.read().await.sent_entries.len();
        assert!(len * 5 <= 3 * 6, "history grew to {len}");
    }
    store.persist(&state).await.unwrap();

    let reloaded = store.load().state;
    let kept: Vec<String> = reloaded.sent_entries.keys().map(str::to_string).collect();
    let expected: Vec<String> = (2..5)
        .map(|n| herald::storage::item_fingerprint(&candidate(n)))
        .collect();
    assert_eq!(kept, expected);
}

// ============================================================================
// Backups
// ============================================================================

#[test]
fn test_backup_restore_cycle() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());

    let mut state = State::fresh(Utc::now());
    state.sent_entries.insert("before-backup", Utc::now());
    store.save(&state).unwrap();
    let backup = store.backup().unwrap();

    state.sent_entries.insert("after-backup", Utc::now());
    store.save(&state).unwrap();
    assert_eq!(store.load().state.sent_entries.len(), 2);

    let restored = store.restore_from_backup(&backup).unwrap();
    assert_eq!(restored.sent_entries.len(), 1);

    let live = store.load().state;
    assert!(live.sent_entries.contains("before-backup"));
    assert!(!live.sent_entries.contains("after-backup"));
}

#[test]
fn test_restore_missing_backup_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    let err = store
        .restore_from_backup(&dir.path().join("backups/nope.json"))
        .unwrap_err();
    assert!(matches!(err, StoreError::BackupNotFound(_)));
}
