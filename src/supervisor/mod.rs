//! Resource lifecycle supervision
//!
//! Three independent maintenance loops keep a long-running process healthy:
//!
//! ```text
//! ┌───────────────────┐  every session_refresh   ┌───────────────┐
//! │ session refresh   │ ───────────────────────► │ SessionHandle │
//! ├───────────────────┤  every task_monitor      ├───────────────┤
//! │ task reaper       │ ───────────────────────► │ TaskRegistry  │
//! ├───────────────────┤  every cleanup_interval  ├───────────────┤
//! │ artifact cleanup  │ ───────────────────────► │ media dir     │
//! └───────────────────┘                          └───────────────┘
//! ```
//!
//! Each loop contains its own failures, panics included, and exits as soon
//! as the shutdown watch flips.

pub mod cleanup;
pub mod session;
pub mod tasks;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use cleanup::{ArtifactCleaner, CleanupReport};
pub use session::{SessionConfig, SessionError, SessionHandle, SessionLease};
pub use tasks::{ReapReport, TaskRegistry, TaskTicket, TaskWaitError};

use crate::config::SupervisorConfig;
use crate::storage::SharedState;

/// Owns the maintenance loops
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    session: Arc<SessionHandle>,
    tasks: Arc<TaskRegistry>,
    cleaner: ArtifactCleaner,
    state: SharedState,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        session: Arc<SessionHandle>,
        tasks: Arc<TaskRegistry>,
        cleaner: ArtifactCleaner,
        state: SharedState,
    ) -> Self {
        Self {
            config,
            session,
            tasks,
            cleaner,
            state,
        }
    }

    /// Spawn all maintenance loops
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> SupervisorHandle {
        tracing::info!(
            session_refresh_secs = self.config.session_refresh_secs,
            task_monitor_secs = self.config.task_monitor_secs,
            cleanup_interval_secs = self.config.cleanup_interval_secs,
            max_tasks = self.config.max_tasks,
            "Supervisor starting"
        );

        let handles = vec![
            self.spawn_session_refresh(shutdown.clone()),
            self.spawn_task_monitor(shutdown.clone()),
            self.spawn_cleanup(shutdown),
        ];

        SupervisorHandle {
            handles,
            session: Arc::clone(&self.session),
            tasks: Arc::clone(&self.tasks),
        }
    }

    fn spawn_session_refresh(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let refresh = self.config.session_refresh();
        let retry = self.config.session_retry();

        tokio::spawn(async move {
            let mut delay = refresh;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let outcome = contained("session refresh", session.refresh()).await;
                        delay = match outcome {
                            Some(Ok(generation)) => {
                                tracing::debug!(generation = generation, "Scheduled session refresh done");
                                refresh
                            }
                            Some(Err(e)) => {
                                tracing::error!(error = %e, retry_secs = retry.as_secs(), "Session refresh failed");
                                retry
                            }
                            None => retry,
                        };
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Session refresh loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_task_monitor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        let interval = self.config.task_monitor_interval();
        let max_tasks = self.config.max_tasks;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Some(report) = contained("task monitor", tasks.reap(max_tasks)).await {
                            tracing::debug!(
                                running = report.running,
                                pruned = report.pruned,
                                aborted = report.aborted,
                                "Task monitor pass"
                            );
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Task monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_cleanup(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let interval = self.config.cleanup_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        contained("artifact cleanup", supervisor.run_cleanup()).await;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Artifact cleanup shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One cleanup pass, recorded into state stats
    pub async fn run_cleanup(&self) -> Option<CleanupReport> {
        let cleaner = self.cleaner.clone();
        let result = tokio::task::spawn_blocking(move || cleaner.clean())
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        let mut state = self.state.write().await;
        let stats = &mut state.stats;
        stats.insert("last_cleanup".to_string(), json!(Utc::now().to_rfc3339()));

        match result {
            Ok(report) => {
                let total_deleted = stats
                    .get("artifacts_deleted")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    + report.deleted as u64;
                let total_freed = stats
                    .get("bytes_freed")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    + report.bytes_freed;
                stats.insert("artifacts_deleted".to_string(), json!(total_deleted));
                stats.insert("bytes_freed".to_string(), json!(total_freed));
                stats.insert(
                    "last_cleanup_result".to_string(),
                    json!(format!(
                        "deleted {} files ({})",
                        report.deleted,
                        crate::utils::format_bytes(report.bytes_freed)
                    )),
                );
                crate::metrics::record_artifacts_deleted(report.deleted, report.bytes_freed);
                tracing::info!(
                    dir = %self.cleaner.dir().display(),
                    deleted = report.deleted,
                    bytes_freed = report.bytes_freed,
                    failed = report.failed,
                    "Artifact cleanup finished"
                );
                Some(report)
            }
            Err(e) => {
                stats.insert("last_cleanup_result".to_string(), json!(format!("error: {e}")));
                tracing::error!(error = %e, "Artifact cleanup failed");
                None
            }
        }
    }
}

/// Run one loop iteration, turning a panic into a logged `None`
async fn contained<F, T>(routine: &'static str, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(routine = routine, "Maintenance routine panicked, continuing");
            None
        }
    }
}

/// Handle to the running maintenance loops
#[derive(Debug)]
pub struct SupervisorHandle {
    handles: Vec<JoinHandle<()>>,
    session: Arc<SessionHandle>,
    tasks: Arc<TaskRegistry>,
}

impl SupervisorHandle {
    /// Whether every loop is still running
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }

    /// Wait for the loops to exit, then cancel tracked tasks and close the session
    ///
    /// Send the shutdown signal first.
    pub async fn join(self, grace: Duration) {
        for handle in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Supervisor loop failed"),
                Err(_) => tracing::warn!(grace_secs = grace.as_secs(), "Supervisor loop did not stop in time"),
            }
        }

        let cancelled = self.tasks.abort_all().await;
        if cancelled > 0 {
            tracing::info!(cancelled = cancelled, "Cancelled background tasks");
        }
        self.session.close().await;
        tracing::info!("Supervisor stopped");
    }
}
