//! Cycle driver
//!
//! One cycle:
//!
//! 1. fetch candidates, drop items without a link;
//! 2. per candidate, in fetch order: dedup check, wait for the scheduler,
//!    enhance, acquire media, emit;
//! 3. on acknowledged emission: record, persist, mark the scheduler.
//!
//! A failed candidate is logged and counted; the cycle moves on. A failed
//! fetch fails the cycle and [`Orchestrator::run`] backs off before the next.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::{CandidateItem, Publication, RunStats};
use crate::channels::Emitter;
use crate::enhance::{EnhanceOutcome, Enhancer, PassthroughEnhancer};
use crate::feed::FeedSource;
use crate::media::{MediaPolicy, MediaSource};
use crate::scheduler::{PublicationMode, PublicationScheduler, WaitOutcome};
use crate::storage::{DedupEngine, DedupVerdict, SharedState, StateStore};
use crate::supervisor::TaskRegistry;
use crate::utils::error::FetchError;
use crate::utils::{normalize_whitespace, truncate_words};

/// Longest pause after a failed cycle
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Emissions allowed per cycle
    pub max_posts_per_cycle: usize,
    /// Pause between cycles
    pub check_interval: Duration,
    /// Periodic state flush
    pub save_interval: Duration,
    pub media_policy: MediaPolicy,
    pub media_timeout: Duration,
    /// Keep downloaded images after emission
    pub keep_media: bool,
    /// Titles shorter than this are skipped
    pub min_title_length: usize,
    pub max_title_length: usize,
    pub max_description_length: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_posts_per_cycle: 5,
            check_interval: Duration::from_secs(300),
            save_interval: Duration::from_secs(300),
            media_policy: MediaPolicy::BestEffort,
            media_timeout: Duration::from_secs(30),
            keep_media: false,
            min_title_length: 5,
            max_title_length: 1500,
            max_description_length: 10_000,
        }
    }
}

impl OrchestratorConfig {
    /// Pause after a failed cycle
    pub fn error_backoff(&self) -> Duration {
        (self.check_interval * 2).min(MAX_ERROR_BACKOFF)
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Published {
        fingerprint: String,
        remote_id: Option<String>,
    },
    Duplicate {
        fingerprint: String,
        kind: &'static str,
    },
    /// Dropped locally (too short, no image under `Required`)
    Skipped { fingerprint: String, reason: String },
    /// Refused by the enhancer
    Rejected { fingerprint: String, reason: String },
    /// Transient failure; the item stays unrecorded
    Failed {
        fingerprint: String,
        stage: &'static str,
        reason: String,
    },
}

impl ItemOutcome {
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Published { fingerprint, .. }
            | Self::Duplicate { fingerprint, .. }
            | Self::Skipped { fingerprint, .. }
            | Self::Rejected { fingerprint, .. }
            | Self::Failed { fingerprint, .. } => fingerprint,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

/// Summary of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Items returned by the feed
    pub fetched: usize,
    /// Items with a link
    pub candidates: usize,
    pub outcomes: Vec<ItemOutcome>,
    /// Shutdown arrived mid-cycle
    pub interrupted: bool,
    pub duration: Duration,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_published()).count()
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Duplicate { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Drives fetch, filter, wait, emit, record
pub struct Orchestrator {
    config: OrchestratorConfig,
    feed: Arc<dyn FeedSource>,
    dedup: DedupEngine,
    scheduler: Arc<PublicationScheduler>,
    enhancer: Arc<dyn Enhancer>,
    media: Option<Arc<dyn MediaSource>>,
    emitter: Arc<dyn Emitter>,
    store: Arc<StateStore>,
    tasks: Arc<TaskRegistry>,
    stats: Mutex<RunStats>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        feed: Arc<dyn FeedSource>,
        dedup: DedupEngine,
        scheduler: Arc<PublicationScheduler>,
        emitter: Arc<dyn Emitter>,
        store: Arc<StateStore>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            feed,
            dedup,
            scheduler,
            enhancer: Arc::new(PassthroughEnhancer),
            media: None,
            emitter,
            store,
            tasks,
            stats: Mutex::new(RunStats::default()),
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn Enhancer>) -> Self {
        self.enhancer = enhancer;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Continue counters from a previous run
    pub fn with_stats(self, stats: RunStats) -> Self {
        *self.stats_guard() = stats;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<PublicationScheduler> {
        &self.scheduler
    }

    /// Snapshot of the run counters
    pub fn stats(&self) -> RunStats {
        self.stats_guard().clone()
    }

    fn stats_guard(&self) -> MutexGuard<'_, RunStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> &SharedState {
        self.dedup.state()
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run cycles until shutdown, then flush state
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            emitter = self.emitter.name(),
            mode = %self.scheduler.mode(),
            check_interval_secs = self.config.check_interval.as_secs(),
            max_posts_per_cycle = self.config.max_posts_per_cycle,
            "Orchestrator started"
        );

        let mut last_save = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle(&mut shutdown).await {
                Ok(report) if report.interrupted => break,
                Ok(report) => {
                    tracing::info!(
                        fetched = report.fetched,
                        published = report.published(),
                        duplicates = report.duplicates(),
                        failed = report.failed(),
                        duration_ms = report.duration.as_millis() as u64,
                        "Cycle finished"
                    );
                    self.config.check_interval
                }
                Err(e) => {
                    self.stats_guard().errors += 1;
                    let backoff = self.config.error_backoff();
                    tracing::error!(error = %e, backoff_secs = backoff.as_secs(), "Cycle failed");
                    backoff
                }
            };

            if last_save.elapsed() >= self.config.save_interval {
                self.flush().await;
                last_save = Instant::now();
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.flush().await;
        tracing::info!("Orchestrator stopped");
    }

    /// Write counters into state and persist it
    pub async fn flush(&self) {
        self.sync_stats().await;
        if let Err(e) = self.store.persist(self.state()).await {
            tracing::error!(error = %e, path = %self.store.path().display(), "State save failed");
        }
    }

    async fn sync_stats(&self) {
        let stats = self.stats();
        let mut state = self.state().write().await;
        stats.write_into(&mut state.stats);
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one cycle
    ///
    /// Fails only when candidates could not be fetched at all.
    pub async fn run_cycle(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CycleReport, FetchError> {
        let started = Instant::now();
        self.stats_guard().last_check = Some(Utc::now());

        let fetched = self.feed.fetch_candidates().await?;
        crate::metrics::record_items_fetched(fetched.len());

        let mut report = CycleReport {
            fetched: fetched.len(),
            ..Default::default()
        };
        let candidates: Vec<CandidateItem> =
            fetched.into_iter().filter(CandidateItem::has_link).collect();
        report.candidates = candidates.len();
        tracing::debug!(fetched = report.fetched, candidates = report.candidates, "Candidates fetched");

        for item in &candidates {
            if report.published() >= self.config.max_posts_per_cycle {
                tracing::debug!(limit = self.config.max_posts_per_cycle, "Per-cycle limit reached");
                break;
            }

            match self.process_item(item, shutdown).await {
                Some(outcome) => report.outcomes.push(outcome),
                None => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        if !report.interrupted && self.scheduler.mode() == PublicationMode::FixedSlots {
            if report.published() == 0 {
                self.scheduler.roll_idle_slot();
            }
            if report.candidates == 0
                && self.scheduler.wait_until_eligible(shutdown).await == WaitOutcome::Shutdown
            {
                report.interrupted = true;
            }
        }

        report.duration = started.elapsed();
        self.stats_guard().record_cycle(report.duration);
        crate::metrics::observe_cycle_duration(report.duration);
        self.sync_stats().await;

        Ok(report)
    }

    /// Carry one candidate through the pipeline; `None` on shutdown
    async fn process_item(
        &self,
        item: &CandidateItem,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ItemOutcome> {
        let fingerprint = match self.dedup.check(item).await {
            DedupVerdict::New { fingerprint } => fingerprint,
            verdict => {
                self.stats_guard().duplicates_rejected += 1;
                crate::metrics::record_duplicate(verdict.kind());
                tracing::debug!(fingerprint = %verdict.fingerprint(), kind = verdict.kind(), "Duplicate skipped");
                return Some(ItemOutcome::Duplicate {
                    fingerprint: verdict.fingerprint().to_string(),
                    kind: verdict.kind(),
                });
            }
        };

        if item.title.trim().chars().count() < self.config.min_title_length {
            return Some(self.skipped(fingerprint, "title too short"));
        }

        if self.scheduler.wait_until_eligible(shutdown).await == WaitOutcome::Shutdown {
            return None;
        }

        let (title, description) = match self.enhancer.enhance(&item.title, &item.description).await {
            EnhanceOutcome::Enhanced { title, description } => (
                truncate_words(&normalize_whitespace(&title), self.config.max_title_length),
                truncate_words(&normalize_whitespace(&description), self.config.max_description_length),
            ),
            EnhanceOutcome::Rejected { reason } => {
                self.stats_guard().posts_skipped += 1;
                tracing::info!(fingerprint = %fingerprint, reason = %reason, "Item rejected by enhancer");
                return Some(ItemOutcome::Rejected { fingerprint, reason });
            }
            EnhanceOutcome::Failed(reason) => return Some(self.failed(fingerprint, "enhance", reason)),
        };

        let image_path = self.acquire_media(item, &fingerprint).await;
        if image_path.is_none() && self.config.media_policy == MediaPolicy::Required {
            return Some(self.skipped(fingerprint, "no image"));
        }

        let publication = Publication {
            fingerprint: fingerprint.clone(),
            title,
            description,
            link: item.link.clone(),
            image_path,
            source: item.source.clone(),
        };

        let delivery = self.emitter.emit(&publication).await;
        self.discard_media(&publication).await;

        let status = match delivery {
            Ok(status) if status.success => status,
            Ok(status) => {
                let reason = status.message.unwrap_or_else(|| "not acknowledged".to_string());
                return Some(self.failed(fingerprint, "emit", reason));
            }
            Err(e) => return Some(self.failed(fingerprint, "emit", e.to_string())),
        };

        let now = self.scheduler.now();
        self.dedup.record_at(item, now).await;
        self.scheduler.mark_emitted(now);
        self.stats_guard().record_post(now);
        crate::metrics::record_item_emitted();
        self.flush().await;

        tracing::info!(
            fingerprint = %fingerprint,
            channel = %status.channel,
            remote_id = ?status.remote_id,
            "Published"
        );
        Some(ItemOutcome::Published {
            fingerprint,
            remote_id: status.remote_id,
        })
    }

    async fn acquire_media(&self, item: &CandidateItem, fingerprint: &str) -> Option<std::path::PathBuf> {
        if self.config.media_policy == MediaPolicy::Disabled {
            return None;
        }
        let media = Arc::clone(self.media.as_ref()?);
        let task_item = item.clone();
        let task_fp = fingerprint.to_string();
        let name = format!("media:{}", &fingerprint[..fingerprint.len().min(12)]);

        let ticket = self
            .tasks
            .spawn(name, async move { media.acquire_image(&task_item, &task_fp).await });

        match ticket.wait(self.config.media_timeout).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Image unavailable");
                None
            }
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Image download abandoned");
                None
            }
        }
    }

    async fn discard_media(&self, publication: &Publication) {
        if self.config.keep_media {
            return;
        }
        if let Some(path) = &publication.image_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Could not remove image");
            }
        }
    }

    fn skipped(&self, fingerprint: String, reason: &str) -> ItemOutcome {
        self.stats_guard().posts_skipped += 1;
        tracing::debug!(fingerprint = %fingerprint, reason = reason, "Item skipped");
        ItemOutcome::Skipped {
            fingerprint,
            reason: reason.to_string(),
        }
    }

    fn failed(&self, fingerprint: String, stage: &'static str, reason: String) -> ItemOutcome {
        self.stats_guard().errors += 1;
        crate::metrics::record_item_failure(stage);
        tracing::warn!(fingerprint = %fingerprint, stage = stage, reason = %reason, "Item failed");
        ItemOutcome::Failed {
            fingerprint,
            stage,
            reason,
        }
    }
}
