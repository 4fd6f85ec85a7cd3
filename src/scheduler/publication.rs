//! Publication pacing and fixed daily slots
//!
//! The scheduler answers one question: when may the next item be emitted?
//!
//! - **Pacing**: at least `min_interval` after the previous emission.
//! - **Fixed slots**: at the next configured time of day. The computed slot is
//!   cached and only moves when an emission is marked or the schedule is
//!   reconfigured.
//!
//! Reconfiguration is synchronous and raises a one-shot change flag that a
//! pending [`PublicationScheduler::wait_until_eligible`] picks up within one
//! wait slice.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use super::clock::{Clock, SystemClock};
use super::error::{SchedulerError, SchedulerResult};
use super::slots::{default_slots, format_slots, next_slot_after, normalize_slots};

/// Upper bound on a single sleep inside a wait
pub const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Interval between progress logs while waiting
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Settings
// ============================================================================

/// How emissions are spaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationMode {
    /// Fixed delay after each emission
    Pacing,
    /// Fixed times of day
    FixedSlots,
}

impl PublicationMode {
    /// Config name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pacing => "pacing",
            Self::FixedSlots => "fixed_slots",
        }
    }
}

impl fmt::Display for PublicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pacing" | "delay" | "interval" => Ok(Self::Pacing),
            "fixed_slots" | "fixed" | "slots" | "schedule" => Ok(Self::FixedSlots),
            other => Err(SchedulerError::invalid_mode(other)),
        }
    }
}

/// Full scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSettings {
    pub mode: PublicationMode,
    pub min_interval: Duration,
    pub slots: Vec<NaiveTime>,
    pub utc_offset: FixedOffset,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            mode: PublicationMode::Pacing,
            min_interval: Duration::from_secs(300),
            slots: default_slots(),
            utc_offset: Utc.fix(),
        }
    }
}

impl ScheduleSettings {
    /// Pacing settings with the given interval
    pub fn pacing(min_interval: Duration) -> Self {
        Self {
            mode: PublicationMode::Pacing,
            min_interval,
            ..Default::default()
        }
    }

    /// Fixed-slot settings
    pub fn fixed_slots(slots: Vec<NaiveTime>, utc_offset: FixedOffset) -> Self {
        Self {
            mode: PublicationMode::FixedSlots,
            slots: normalize_owned(slots),
            utc_offset,
            ..Default::default()
        }
    }
}

fn normalize_owned(mut slots: Vec<NaiveTime>) -> Vec<NaiveTime> {
    slots.sort_unstable();
    slots.dedup();
    if slots.is_empty() {
        return default_slots();
    }
    slots
}

/// Partial settings change applied by [`PublicationScheduler::update_settings`]
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub mode: Option<PublicationMode>,
    pub min_interval: Option<Duration>,
    pub slots: Option<Vec<NaiveTime>>,
    pub utc_offset: Option<FixedOffset>,
}

/// Outcome of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The next emission may happen now
    Eligible,
    /// Shutdown was requested while waiting
    Shutdown,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub mode: PublicationMode,
    pub min_interval_secs: u64,
    pub slots: String,
    pub utc_offset: String,
    pub last_emission: Option<DateTime<Utc>>,
    pub next_eligible: DateTime<Utc>,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mode:            {}", self.mode)?;
        match self.mode {
            PublicationMode::Pacing => {
                writeln!(f, "Min interval:    {}s", self.min_interval_secs)?
            }
            PublicationMode::FixedSlots => {
                writeln!(f, "Slots:           {} (UTC{})", self.slots, self.utc_offset)?
            }
        }
        match self.last_emission {
            Some(ts) => writeln!(f, "Last emission:   {}", ts.to_rfc3339())?,
            None => writeln!(f, "Last emission:   -")?,
        }
        write!(f, "Next eligible:   {}", self.next_eligible.to_rfc3339())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug)]
struct Inner {
    settings: ScheduleSettings,
    last_emission: Option<DateTime<Utc>>,
    next_slot: Option<DateTime<Utc>>,
}

/// Decides when the next emission may happen
#[derive(Debug)]
pub struct PublicationScheduler {
    inner: Mutex<Inner>,
    changed: AtomicBool,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl PublicationScheduler {
    /// Create a scheduler reading time from `clock`
    pub fn new(settings: ScheduleSettings, clock: Arc<dyn Clock>) -> Self {
        let settings = ScheduleSettings {
            slots: normalize_owned(settings.slots),
            ..settings
        };
        Self {
            inner: Mutex::new(Inner {
                settings,
                last_emission: None,
                next_slot: None,
            }),
            changed: AtomicBool::new(false),
            notify: Notify::new(),
            clock,
        }
    }

    /// Create a scheduler on the system clock
    pub fn with_system_clock(settings: ScheduleSettings) -> Self {
        Self::new(settings, Arc::new(SystemClock))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current instant according to the scheduler's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current settings
    pub fn settings(&self) -> ScheduleSettings {
        self.inner().settings.clone()
    }

    /// Current mode
    pub fn mode(&self) -> PublicationMode {
        self.inner().settings.mode
    }

    /// Instant of the last marked emission
    pub fn last_emission(&self) -> Option<DateTime<Utc>> {
        self.inner().last_emission
    }

    /// Seed the last emission, e.g. from persisted stats
    pub fn restore_last_emission(&self, at: DateTime<Utc>) {
        let now = self.now();
        let mut inner = self.inner();
        inner.last_emission = Some(at);
        if inner.settings.mode == PublicationMode::FixedSlots {
            let anchor = if at > now { at } else { now };
            inner.next_slot = next_slot_after(&inner.settings.slots, inner.settings.utc_offset, anchor);
        }
    }

    /// Earliest instant the next emission may happen
    ///
    /// In fixed-slot mode the slot is computed once and cached.
    pub fn next_eligible(&self) -> DateTime<Utc> {
        let now = self.now();
        let mut inner = self.inner();
        Self::eligible_locked(&mut inner, now)
    }

    fn eligible_locked(inner: &mut Inner, now: DateTime<Utc>) -> DateTime<Utc> {
        match inner.settings.mode {
            PublicationMode::Pacing => match inner.last_emission {
                Some(last) => TimeDelta::from_std(inner.settings.min_interval)
                    .ok()
                    .and_then(|interval| last.checked_add_signed(interval))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                None => now,
            },
            PublicationMode::FixedSlots => {
                if let Some(slot) = inner.next_slot {
                    return slot;
                }
                let slot = next_slot_after(&inner.settings.slots, inner.settings.utc_offset, now)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                inner.next_slot = Some(slot);
                slot
            }
        }
    }

    /// Time left until [`next_eligible`](Self::next_eligible), zero if passed
    pub fn time_until_eligible(&self) -> Duration {
        let now = self.now();
        let mut inner = self.inner();
        let eligible = Self::eligible_locked(&mut inner, now);
        (eligible - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether an emission may happen now
    pub fn is_eligible(&self) -> bool {
        self.time_until_eligible().is_zero()
    }

    /// Record an emission at `at`
    ///
    /// In fixed-slot mode the cached slot rolls to the first slot strictly
    /// after `at`.
    pub fn mark_emitted(&self, at: DateTime<Utc>) {
        let mut inner = self.inner();
        inner.last_emission = Some(at);
        inner.next_slot = match inner.settings.mode {
            PublicationMode::FixedSlots => {
                next_slot_after(&inner.settings.slots, inner.settings.utc_offset, at)
            }
            PublicationMode::Pacing => None,
        };
        tracing::debug!(
            at = %at,
            mode = %inner.settings.mode,
            next_slot = ?inner.next_slot,
            "Emission marked"
        );
    }

    /// Move a passed slot forward when a cycle had nothing to publish
    ///
    /// Returns `true` when the slot moved.
    pub fn roll_idle_slot(&self) -> bool {
        let now = self.now();
        let mut inner = self.inner();
        if inner.settings.mode != PublicationMode::FixedSlots {
            return false;
        }
        match inner.next_slot {
            Some(slot) if slot <= now => {
                inner.next_slot =
                    next_slot_after(&inner.settings.slots, inner.settings.utc_offset, now);
                tracing::debug!(skipped = %slot, next = ?inner.next_slot, "Idle slot rolled forward");
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Live reconfiguration
    // ========================================================================

    /// Switch publication mode
    pub fn set_mode(&self, mode: PublicationMode) {
        self.apply(ScheduleUpdate {
            mode: Some(mode),
            ..Default::default()
        });
    }

    /// Change the pacing interval
    pub fn set_min_interval(&self, interval: Duration) -> SchedulerResult<()> {
        self.update_settings(ScheduleUpdate {
            min_interval: Some(interval),
            ..Default::default()
        })
    }

    /// Replace the daily slots; an empty list restores the defaults
    pub fn set_slots(&self, slots: Vec<NaiveTime>) {
        self.apply(ScheduleUpdate {
            slots: Some(slots),
            ..Default::default()
        });
    }

    /// Replace the daily slots from a comma-separated list
    pub fn set_slots_from_str(&self, input: &str) {
        let slots = normalize_slots(input.split(',').filter(|s| !s.trim().is_empty()));
        self.set_slots(slots);
    }

    /// Apply a partial settings change atomically
    pub fn update_settings(&self, update: ScheduleUpdate) -> SchedulerResult<()> {
        if let Some(interval) = update.min_interval {
            if interval.is_zero() {
                return Err(SchedulerError::InvalidInterval { seconds: 0 });
            }
        }
        self.apply(update);
        Ok(())
    }

    fn apply(&self, update: ScheduleUpdate) {
        let now = self.now();
        let mut inner = self.inner();

        if let Some(mode) = update.mode {
            inner.settings.mode = mode;
        }
        if let Some(interval) = update.min_interval {
            inner.settings.min_interval = interval;
        }
        if let Some(slots) = update.slots {
            inner.settings.slots = normalize_owned(slots);
        }
        if let Some(offset) = update.utc_offset {
            inner.settings.utc_offset = offset;
        }

        inner.next_slot = None;
        let next = Self::eligible_locked(&mut inner, now);
        tracing::info!(
            mode = %inner.settings.mode,
            min_interval_secs = inner.settings.min_interval.as_secs(),
            slots = %format_slots(&inner.settings.slots),
            next_eligible = %next,
            "Publication schedule updated"
        );
        drop(inner);

        self.changed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Snapshot for status reporting
    pub fn status(&self) -> ScheduleStatus {
        let now = self.now();
        let mut inner = self.inner();
        let next_eligible = Self::eligible_locked(&mut inner, now);
        ScheduleStatus {
            mode: inner.settings.mode,
            min_interval_secs: inner.settings.min_interval.as_secs(),
            slots: format_slots(&inner.settings.slots),
            utc_offset: inner.settings.utc_offset.to_string(),
            last_emission: inner.last_emission,
            next_eligible,
        }
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Suspend until the next emission is allowed or shutdown is requested
    ///
    /// Sleeps in slices of at most [`WAIT_SLICE`], re-evaluating after every
    /// slice and immediately after a reconfiguration.
    pub async fn wait_until_eligible(&self, shutdown: &mut watch::Receiver<bool>) -> WaitOutcome {
        let started = tokio::time::Instant::now();
        let mut last_log = started;
        let mut announced = false;

        loop {
            if *shutdown.borrow() {
                return WaitOutcome::Shutdown;
            }

            if self.changed.swap(false, Ordering::SeqCst) {
                tracing::debug!("Schedule changed, re-evaluating wait");
            }

            let remaining = self.time_until_eligible();
            if remaining.is_zero() {
                if announced {
                    tracing::debug!(
                        waited_secs = started.elapsed().as_secs(),
                        "Publication window open"
                    );
                }
                return WaitOutcome::Eligible;
            }

            if !announced {
                tracing::info!(
                    mode = %self.mode(),
                    wait_secs = remaining.as_secs(),
                    next_eligible = %self.next_eligible(),
                    "Waiting for publication window"
                );
                announced = true;
            } else if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                tracing::info!(remaining_secs = remaining.as_secs(), "Still waiting to publish");
                last_log = tokio::time::Instant::now();
            }

            let slice = remaining.min(WAIT_SLICE);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return WaitOutcome::Shutdown;
                    }
                }
            }
        }
    }

    /// Whether a change is pending that a waiter has not observed yet
    pub fn schedule_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }
}
