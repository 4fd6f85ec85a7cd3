//! Interprocess advisory lock guarding state file writes
//!
//! The lock lives next to the state file (`bot_state.json.lock`). Acquisition
//! polls an exclusive `flock`-style lock until a deadline. A lock file whose
//! modification time is older than the stale threshold is considered
//! abandoned and unlinked before the next attempt.
//!
//! Because holders unlink the file on release, a lock taken on an inode that
//! is no longer linked at the path does not count; acquisition retries.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::StoreError;

/// Lock acquisition settings
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Give up after waiting this long
    pub timeout: Duration,

    /// Delay between attempts
    pub poll_interval: Duration,

    /// Lock files older than this are removed as abandoned
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Path of the lock file guarding `state_path`
pub fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut name = state_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    state_path.with_file_name(name)
}

/// Held lock; released and removed on drop
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock for `state_path`, blocking the current thread
    ///
    /// Call from a blocking context (`spawn_blocking`) inside async code.
    pub fn acquire(state_path: &Path, config: &LockConfig) -> Result<Self, StoreError> {
        let path = lock_path_for(state_path);
        let deadline = Instant::now() + config.timeout;

        loop {
            remove_if_stale(&path, config.stale_after);

            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| StoreError::io("open lock file", &path, e))?;

            match file.try_lock_exclusive() {
                Ok(()) if !is_linked_at(&file, &path) => {
                    tracing::debug!(path = %path.display(), "Locked an unlinked lock file, retrying");
                    drop(file);
                }
                Ok(()) => {
                    let mut lock = Self { file, path };
                    lock.stamp_holder();
                    tracing::debug!(path = %lock.path.display(), "State lock acquired");
                    return Ok(lock);
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(StoreError::io("lock state file", &path, e)),
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    path = %path.display(),
                    timeout_secs = config.timeout.as_secs(),
                    "Timed out waiting for state lock"
                );
                return Err(StoreError::LockTimeout {
                    path,
                    waited: config.timeout,
                });
            }

            std::thread::sleep(config.poll_interval);
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp_holder(&mut self) {
        let holder = format!(
            "pid={} acquired={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        let written = self
            .file
            .set_len(0)
            .and_then(|_| self.file.write_all(holder.as_bytes()))
            .and_then(|_| self.file.flush());
        if let Err(e) = written {
            tracing::debug!(error = %e, "Could not record lock holder");
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Lock file already gone");
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        }
    }
}

/// Whether `file` is still the inode linked at `path`
#[cfg(unix)]
fn is_linked_at(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_linked_at(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

fn remove_if_stale(path: &Path, stale_after: Duration) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());

    if let Some(age) = age {
        if age > stale_after {
            tracing::warn!(
                path = %path.display(),
                age_secs = age.as_secs(),
                "Removing abandoned state lock"
            );
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale lock");
            }
        }
    }
}
