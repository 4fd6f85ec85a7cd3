//! Publication scheduler integration tests
//!
//! Runs the scheduler on tokio's paused clock so multi-hour waits finish
//! instantly while slot and pacing arithmetic stays exact.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use herald::scheduler::{
    next_slot_after, parse_slots, parse_utc_offset, PublicationMode, PublicationScheduler,
    ScheduleSettings, ScheduleUpdate, TokioClock, WaitOutcome,
};

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, minute, 0).unwrap()
}

fn fixed_scheduler(slots: &str, offset: &str, start: DateTime<Utc>) -> PublicationScheduler {
    PublicationScheduler::new(
        ScheduleSettings::fixed_slots(parse_slots(slots), parse_utc_offset(offset).unwrap()),
        Arc::new(TokioClock::starting_at(start)),
    )
}

// ============================================================================
// Slot Selection
// ============================================================================

#[test]
fn test_next_slot_later_today_and_rollover() {
    let slots = parse_slots("09:00,12:00");
    let utc = parse_utc_offset("+00:00").unwrap();

    assert_eq!(next_slot_after(&slots, utc, at(3, 10, 30)), Some(at(3, 12, 0)));
    assert_eq!(next_slot_after(&slots, utc, at(3, 13, 0)), Some(at(4, 9, 0)));
}

#[test]
fn test_next_slot_respects_offset() {
    let slots = parse_slots("09:00,12:00");
    let plus_three = parse_utc_offset("+03:00").unwrap();

    // 07:30 UTC is 10:30 local, so the 12:00 local slot is 09:00 UTC
    assert_eq!(
        next_slot_after(&slots, plus_three, at(3, 7, 30)),
        Some(at(3, 9, 0))
    );
}

// ============================================================================
// Fixed-Slot Waiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fixed_slot_wait_opens_at_slot() {
    let scheduler = fixed_scheduler("09:00,12:00", "+00:00", at(3, 10, 30));
    let (_tx, mut rx) = watch::channel(false);

    assert_eq!(scheduler.next_eligible(), at(3, 12, 0));
    assert!(!scheduler.is_eligible());

    let outcome = scheduler.wait_until_eligible(&mut rx).await;
    assert_eq!(outcome, WaitOutcome::Eligible);

    let now = scheduler.now();
    assert!(now >= at(3, 12, 0));
    assert!(now - at(3, 12, 0) <= TimeDelta::seconds(1));

    scheduler.mark_emitted(now);
    assert_eq!(scheduler.next_eligible(), at(4, 9, 0));
}

#[tokio::test(start_paused = true)]
async fn test_fixed_slot_emissions_never_precede_their_slot() {
    let scheduler = fixed_scheduler("08:00,20:30", "+03:00", at(3, 0, 0));
    let (_tx, mut rx) = watch::channel(false);
    let mut emitted = Vec::new();

    for _ in 0..4 {
        let slot = scheduler.next_eligible();
        assert_eq!(
            scheduler.wait_until_eligible(&mut rx).await,
            WaitOutcome::Eligible
        );
        let now = scheduler.now();
        assert!(now >= slot, "emitted at {now} before slot {slot}");
        scheduler.mark_emitted(now);
        emitted.push(slot);
    }

    // 08:00 and 20:30 at +03:00 are 05:00 and 17:30 UTC
    assert_eq!(
        emitted,
        vec![at(3, 5, 0), at(3, 17, 30), at(4, 5, 0), at(4, 17, 30)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_cycle_rolls_passed_slot() {
    let scheduler = fixed_scheduler("09:00,12:00", "+00:00", at(3, 8, 0));
    assert_eq!(scheduler.next_eligible(), at(3, 9, 0));

    tokio::time::advance(Duration::from_secs(2 * 3600)).await;
    assert!(scheduler.is_eligible());
    assert!(scheduler.roll_idle_slot());
    assert_eq!(scheduler.next_eligible(), at(3, 12, 0));
    assert!(!scheduler.roll_idle_slot());
}

// ============================================================================
// Pacing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pacing_keeps_minimum_gap() {
    let interval = Duration::from_secs(10);
    let scheduler = PublicationScheduler::new(
        ScheduleSettings::pacing(interval),
        Arc::new(TokioClock::starting_at(at(3, 12, 0))),
    );
    let (_tx, mut rx) = watch::channel(false);
    let mut emissions = Vec::new();

    for _ in 0..4 {
        assert_eq!(
            scheduler.wait_until_eligible(&mut rx).await,
            WaitOutcome::Eligible
        );
        let now = scheduler.now();
        scheduler.mark_emitted(now);
        emissions.push(now);
    }

    assert_eq!(emissions[0], at(3, 12, 0), "first emission is immediate");
    for pair in emissions.windows(2) {
        assert!(pair[1] - pair[0] >= TimeDelta::seconds(10));
    }
}

#[tokio::test(start_paused = true)]
async fn test_restored_last_emission_delays_first_post() {
    let start = at(3, 12, 0);
    let scheduler = PublicationScheduler::new(
        ScheduleSettings::pacing(Duration::from_secs(300)),
        Arc::new(TokioClock::starting_at(start)),
    );
    scheduler.restore_last_emission(start - TimeDelta::seconds(60));

    assert_eq!(scheduler.next_eligible(), start + TimeDelta::seconds(240));
    assert_eq!(scheduler.time_until_eligible(), Duration::from_secs(240));
}

// ============================================================================
// Live Reconfiguration and Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shorter_interval_wakes_waiter() {
    let scheduler = Arc::new(PublicationScheduler::new(
        ScheduleSettings::pacing(Duration::from_secs(3600)),
        Arc::new(TokioClock::starting_at(at(3, 12, 0))),
    ));
    scheduler.mark_emitted(scheduler.now());
    let (_tx, mut rx) = watch::channel(false);

    let waiter = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let outcome = scheduler.wait_until_eligible(&mut rx).await;
            (outcome, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    scheduler.set_min_interval(Duration::from_secs(2)).unwrap();

    let (outcome, waited) = waiter.await.unwrap();
    assert_eq!(outcome, WaitOutcome::Eligible);
    assert!(waited < Duration::from_secs(60), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_recomputes_from_now() {
    let scheduler = PublicationScheduler::new(
        ScheduleSettings::pacing(Duration::from_secs(60)),
        Arc::new(TokioClock::starting_at(at(3, 10, 30))),
    );
    scheduler.mark_emitted(scheduler.now());

    scheduler
        .update_settings(ScheduleUpdate {
            mode: Some(PublicationMode::FixedSlots),
            slots: Some(parse_slots("09:00,12:00")),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(scheduler.mode(), PublicationMode::FixedSlots);
    assert_eq!(scheduler.next_eligible(), at(3, 12, 0));
    assert_eq!(scheduler.status().slots, "09:00, 12:00");
}

#[test]
fn test_zero_interval_is_rejected() {
    let scheduler =
        PublicationScheduler::with_system_clock(ScheduleSettings::pacing(Duration::from_secs(30)));
    assert!(scheduler.set_min_interval(Duration::ZERO).is_err());
    assert_eq!(scheduler.settings().min_interval, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_wait() {
    let scheduler = Arc::new(fixed_scheduler("09:00", "+00:00", at(3, 10, 0)));
    let (tx, mut rx) = watch::channel(false);

    let waiter = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.wait_until_eligible(&mut rx).await })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    tx.send(true).unwrap();

    assert_eq!(waiter.await.unwrap(), WaitOutcome::Shutdown);
    assert!(scheduler.now() < at(4, 9, 0));
}

// ============================================================================
// System Clock
// ============================================================================

#[tokio::test]
async fn test_system_clock_pacing_publishes_first_then_waits_gap() {
    let scheduler = PublicationScheduler::with_system_clock(ScheduleSettings::pacing(
        Duration::from_millis(200),
    ));
    let (_tx, mut rx) = watch::channel(false);

    let first = tokio::time::timeout(Duration::from_secs(5), scheduler.wait_until_eligible(&mut rx))
        .await
        .expect("first emission must not wait");
    assert_eq!(first, WaitOutcome::Eligible);
    let emitted = scheduler.now();
    scheduler.mark_emitted(emitted);

    let second = tokio::time::timeout(Duration::from_secs(5), scheduler.wait_until_eligible(&mut rx))
        .await
        .expect("second emission opens after the interval");
    assert_eq!(second, WaitOutcome::Eligible);
    assert!(scheduler.now() - emitted >= TimeDelta::milliseconds(200));
}
