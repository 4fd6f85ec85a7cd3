//! Common test utilities

use std::path::Path;
use std::sync::Arc;

use herald::storage::{StateStore, StoreConfig};
use herald::supervisor::{SessionConfig, SessionHandle};
use herald::CandidateItem;

/// Create a candidate with a unique link and title
pub fn candidate(n: usize) -> CandidateItem {
    CandidateItem::new(
        format!("https://news.example.com/story/{n}"),
        format!("Story number {n}"),
        format!("Body of story {n}"),
    )
}

/// Store rooted in `dir` with backups in `dir/backups`
#[allow(dead_code)]
pub fn store_in(dir: &Path) -> Arc<StateStore> {
    Arc::new(StateStore::new(
        StoreConfig::new(dir.join("state.json")).with_backup_dir(dir.join("backups")),
    ))
}

/// Fresh session with short timeouts
#[allow(dead_code)]
pub fn test_session() -> Arc<SessionHandle> {
    SessionHandle::new(SessionConfig {
        timeout: std::time::Duration::from_secs(5),
        connect_timeout: std::time::Duration::from_secs(2),
        ..SessionConfig::default()
    })
    .expect("session")
}
