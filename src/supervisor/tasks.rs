//! Registry of background tasks
//!
//! Short-lived work (media downloads) is spawned through the registry so the
//! supervisor can bound how many are alive at once. A caller that stops
//! waiting does not cancel the task; it stays tracked until it finishes or is
//! reaped.

use std::cmp::Reverse;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why a tracked task produced no value for its waiter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskWaitError {
    #[error("task '{name}' did not finish within {}s", timeout.as_secs())]
    TimedOut { name: String, timeout: Duration },

    #[error("task '{name}' was cancelled")]
    Cancelled { name: String },
}

#[derive(Debug)]
struct TrackedTask {
    name: String,
    seq: u64,
    spawned_at: Instant,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: Vec<TrackedTask>,
    next_seq: u64,
}

/// Result of one reaping pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Finished tasks dropped from the registry
    pub pruned: usize,
    /// Running tasks cancelled to respect the ceiling
    pub aborted: usize,
    /// Tasks still tracked afterwards
    pub running: usize,
}

/// Pending result of a tracked task
#[derive(Debug)]
pub struct TaskTicket<T> {
    name: String,
    rx: oneshot::Receiver<T>,
}

impl<T> TaskTicket<T> {
    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the output, giving up after `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<T, TaskWaitError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TaskWaitError::Cancelled { name: self.name }),
            Err(_) => Err(TaskWaitError::TimedOut {
                name: self.name,
                timeout,
            }),
        }
    }
}

/// Named task set with a running-task ceiling
#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn and track a future
    pub fn spawn<F, T>(&self, name: impl Into<String>, future: F) -> TaskTicket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let output = future.await;
            if tx.send(output).is_err() {
                tracing::debug!(task = %task_name, "Task finished after its waiter left");
            }
        });

        let mut inner = self.inner();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.push(TrackedTask {
            name: name.clone(),
            seq,
            spawned_at: Instant::now(),
            handle,
        });

        TaskTicket { name, rx }
    }

    /// Tracked tasks, finished ones included until the next reap
    pub fn len(&self) -> usize {
        self.inner().tasks.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.inner().tasks.is_empty()
    }

    /// Tasks still running
    pub fn running(&self) -> usize {
        self.inner()
            .tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Names of tracked tasks in spawn order
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner();
        let mut tasks: Vec<&TrackedTask> = inner.tasks.iter().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Drop finished tasks and cancel the oldest ones above `max_running`
    ///
    /// Age is spawn time; equal spawn times cancel the lexically greatest name
    /// first. Cancelled tasks are awaited before returning.
    pub async fn reap(&self, max_running: usize) -> ReapReport {
        let (doomed, pruned, running) = {
            let mut inner = self.inner();
            let before = inner.tasks.len();
            inner.tasks.retain(|t| !t.handle.is_finished());
            let pruned = before - inner.tasks.len();

            let mut doomed = Vec::new();
            if inner.tasks.len() > max_running {
                let excess = inner.tasks.len() - max_running;
                inner
                    .tasks
                    .sort_by_key(|t| (t.spawned_at, Reverse(t.name.clone()), t.seq));
                doomed = inner.tasks.drain(..excess).collect::<Vec<_>>();
                inner.tasks.sort_by_key(|t| t.seq);
            }
            let running = inner.tasks.len();
            (doomed, pruned, running)
        };

        let aborted = doomed.len();
        for task in doomed {
            tracing::warn!(task = %task.name, "Cancelling task above the running ceiling");
            task.handle.abort();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(task = %task.name, error = %e, "Cancelled task failed");
                }
            }
        }

        if pruned > 0 || aborted > 0 {
            tracing::info!(
                pruned = pruned,
                aborted = aborted,
                running = running,
                "Background tasks reaped"
            );
        }
        crate::metrics::record_tasks_reaped(aborted);

        ReapReport {
            pruned,
            aborted,
            running,
        }
    }

    /// Cancel everything and wait for it
    pub async fn abort_all(&self) -> usize {
        let tasks = std::mem::take(&mut self.inner().tasks);
        let count = tasks.len();
        for task in tasks {
            task.handle.abort();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    tracing::debug!(task = %task.name, error = %e, "Task failed during shutdown");
                }
            }
        }
        count
    }
}
