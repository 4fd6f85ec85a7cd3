//! Removal of expired media artifacts

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    pub failed: usize,
}

/// Deletes files older than the retention period from one directory
#[derive(Debug, Clone)]
pub struct ArtifactCleaner {
    dir: PathBuf,
    retention: Duration,
}

impl ArtifactCleaner {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete expired regular files (not recursive)
    ///
    /// A missing directory is an empty pass. Per-file failures are counted and
    /// logged; only failing to list the directory is an error.
    pub fn clean(&self) -> io::Result<CleanupReport> {
        self.clean_at(SystemTime::now())
    }

    fn clean_at(&self, now: SystemTime) -> io::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            report.scanned += 1;

            let expired = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.retention);
            if !expired {
                continue;
            }

            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.deleted += 1;
                    report.bytes_freed += meta.len();
                    tracing::debug!(path = %path.display(), "Deleted expired artifact");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete artifact");
                }
            }
        }

        Ok(report)
    }
}
