//! Publication scheduling
//!
//! Decides *when* the next item may be emitted.
//!
//! # Modes
//!
//! - **Pacing** - `now - last_emission >= min_interval`
//! - **Fixed slots** - next configured time of day in a fixed UTC offset
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  set_mode / set_slots / …  ┌──────────────┐
//! │ PublicationScheduler │ ◄───────────────────────── │  operators   │
//! │  settings + cache    │                            └──────────────┘
//! │  changed flag+Notify │
//! └─────────┬────────────┘
//!           │ wait_until_eligible (≤1s slices)
//!           ▼
//!     ┌─────────────┐
//!     │ orchestrator│
//!     └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`publication`] - mode logic, cached next slot, live reconfiguration, waits
//! - [`slots`] - slot and UTC offset parsing, next-slot computation
//! - [`clock`] - wall-clock sources (system and tokio-driven)
//! - [`error`] - scheduler error type
//!
//! # Quick Start
//!
//! ```no_run
//! use herald::scheduler::{PublicationScheduler, ScheduleSettings};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let scheduler = PublicationScheduler::with_system_clock(
//!     ScheduleSettings::pacing(Duration::from_secs(300)),
//! );
//! let (_tx, mut shutdown) = tokio::sync::watch::channel(false);
//! scheduler.wait_until_eligible(&mut shutdown).await;
//! scheduler.mark_emitted(scheduler.now());
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod publication;
pub mod slots;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{SchedulerError, SchedulerResult};
pub use publication::{
    PublicationMode, PublicationScheduler, ScheduleSettings, ScheduleStatus, ScheduleUpdate,
    WaitOutcome, PROGRESS_LOG_INTERVAL, WAIT_SLICE,
};
pub use slots::{
    default_slots, format_slots, next_slot_after, parse_slot, parse_slots, parse_utc_offset,
};
