use chrono::Utc;
use std::path::Path;

use herald::config::Config;
use herald::error::{Error, Result};
use herald::pipeline::RunStats;
use herald::scheduler::{format_slots, next_slot_after, parse_slots, parse_utc_offset, PublicationScheduler};
use herald::storage::StateStore;
use herald::utils::format_bytes;

pub fn status(config: &Config) -> Result<()> {
    let store = StateStore::new(config.state.store_config());
    let outcome = store.load();
    let stats = RunStats::from_stats(&outcome.state.stats);

    println!("State: {}", store.path().display());
    println!("{}", store.summary(&outcome.state));
    println!();

    println!("Posts sent:          {}", stats.posts_sent);
    println!("Duplicates rejected: {}", stats.duplicates_rejected);
    println!("Posts skipped:       {}", stats.posts_skipped);
    println!("Errors:              {}", stats.errors);
    println!("Cycles completed:    {}", stats.cycles_completed);
    if stats.cycles_completed > 0 {
        println!("Avg cycle time:      {:.2}s", stats.avg_processing_time);
    }
    if !stats.hourly_stats.is_empty() {
        println!("Hourly:");
        for (hour, count) in &stats.hourly_stats {
            println!("  {hour}: {count}");
        }
    }
    println!();

    let scheduler = PublicationScheduler::with_system_clock(config.publication.schedule_settings());
    if let Some(at) = stats.last_post {
        scheduler.restore_last_emission(at);
    }
    println!("{}", scheduler.status());
    Ok(())
}

pub fn backup(config: &Config) -> Result<()> {
    let store = StateStore::new(config.state.store_config());
    if !store.path().exists() {
        return Err(Error::other(format!("No state file at {}", store.path().display())));
    }
    let path = store.backup()?;
    println!("Backup created: {}", path.display());
    Ok(())
}

pub fn backups(config: &Config) -> Result<()> {
    let store = StateStore::new(config.state.store_config());
    let backups = store.list_backups()?;

    if backups.is_empty() {
        println!("No backups in {}", store.backup_dir().display());
        return Ok(());
    }

    println!("Backups in {} (newest first):", store.backup_dir().display());
    for info in &backups {
        println!(
            "  {}  {:>10}  {}",
            info.modified.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(info.size_bytes),
            info.path.display()
        );
    }
    Ok(())
}

pub fn restore(config: &Config, backup: &Path) -> Result<()> {
    let store = StateStore::new(config.state.store_config());
    let state = store.restore_from_backup(backup)?;
    println!("State restored from {}", backup.display());
    println!("{}", store.summary(&state));
    Ok(())
}

pub fn next_slot(config: &Config, schedule: Option<&str>, utc_offset: Option<&str>) -> Result<()> {
    let slots = parse_slots(schedule.unwrap_or(&config.publication.schedule));
    let offset_raw = utc_offset.unwrap_or(&config.publication.utc_offset);
    let offset = parse_utc_offset(offset_raw)?;

    let now = Utc::now();
    let next = next_slot_after(&slots, offset, now)
        .ok_or_else(|| Error::other("Next slot is out of range"))?;

    println!("Slots:     {} (UTC{})", format_slots(&slots), offset);
    println!("Now:       {}", now.with_timezone(&offset).to_rfc3339());
    println!("Next slot: {}", next.with_timezone(&offset).to_rfc3339());
    println!("Wait:      {}s", (next - now).num_seconds().max(0));
    Ok(())
}
