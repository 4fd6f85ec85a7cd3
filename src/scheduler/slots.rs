//! Daily publication slots
//!
//! Slots are wall-clock times of day interpreted in a fixed UTC offset.

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};

use super::error::{SchedulerError, SchedulerResult};

/// Slots used when none are configured
pub fn default_slots() -> Vec<NaiveTime> {
    [(9, 0), (12, 0), (18, 0)]
        .iter()
        .filter_map(|&(h, m)| NaiveTime::from_hms_opt(h, m, 0))
        .collect()
}

/// Parse one `H:MM` or `H:MM:SS` slot
pub fn parse_slot(raw: &str) -> SchedulerResult<NaiveTime> {
    let input = raw.trim();
    let parts: Vec<&str> = input.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(SchedulerError::invalid_slot(input, "expected H:MM or H:MM:SS"));
    }

    let field = |s: &str, max_len: usize, name: &str| -> SchedulerResult<u32> {
        if s.is_empty() || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SchedulerError::invalid_slot(input, format!("bad {name}")));
        }
        s.parse()
            .map_err(|_| SchedulerError::invalid_slot(input, format!("bad {name}")))
    };

    let hour = field(parts[0], 2, "hour")?;
    if parts[1].len() != 2 {
        return Err(SchedulerError::invalid_slot(input, "minutes need two digits"));
    }
    let minute = field(parts[1], 2, "minute")?;
    let second = match parts.get(2) {
        Some(s) if s.len() == 2 => field(s, 2, "second")?,
        Some(_) => return Err(SchedulerError::invalid_slot(input, "seconds need two digits")),
        None => 0,
    };

    NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| SchedulerError::invalid_slot(input, "time out of range"))
}

/// Parse a comma-separated slot list
///
/// Invalid entries are skipped with a warning. The result is sorted and
/// duplicate free, falling back to [`default_slots`] when nothing is left.
pub fn parse_slots(input: &str) -> Vec<NaiveTime> {
    normalize_slots(input.split(',').filter(|s| !s.trim().is_empty()))
}

/// Same as [`parse_slots`] for an already split list
pub fn normalize_slots<'a>(entries: impl IntoIterator<Item = &'a str>) -> Vec<NaiveTime> {
    let mut slots: Vec<NaiveTime> = entries
        .into_iter()
        .filter_map(|entry| match parse_slot(entry) {
            Ok(slot) => Some(slot),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping invalid publication slot");
                None
            }
        })
        .collect();

    slots.sort_unstable();
    slots.dedup();

    if slots.is_empty() {
        tracing::warn!("No valid publication slots, using defaults");
        return default_slots();
    }
    slots
}

/// Render slots as `HH:MM` (or `HH:MM:SS` when seconds are set)
pub fn format_slots(slots: &[NaiveTime]) -> String {
    slots
        .iter()
        .map(|slot| {
            if slot.format("%S").to_string() == "00" {
                slot.format("%H:%M").to_string()
            } else {
                slot.format("%H:%M:%S").to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a UTC offset such as `+03:00`, `-0530`, `+3`, `Z` or `UTC`
pub fn parse_utc_offset(raw: &str) -> SchedulerResult<FixedOffset> {
    let input = raw.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("z") || input.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| SchedulerError::invalid_utc_offset(input));
    }

    let (sign, rest) = match input.as_bytes()[0] {
        b'+' => (1, &input[1..]),
        b'-' => (-1, &input[1..]),
        _ => return Err(SchedulerError::invalid_utc_offset(input)),
    };
    if !rest.is_ascii() {
        return Err(SchedulerError::invalid_utc_offset(input));
    }

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };

    let hours: i32 = hours
        .parse()
        .map_err(|_| SchedulerError::invalid_utc_offset(input))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| SchedulerError::invalid_utc_offset(input))?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(SchedulerError::invalid_utc_offset(input));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| SchedulerError::invalid_utc_offset(input))
}

/// Earliest slot strictly after `after`, today or on the following day
pub fn next_slot_after(
    slots: &[NaiveTime],
    offset: FixedOffset,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local_date = after.with_timezone(&offset).date_naive();
    let at = |date: chrono::NaiveDate, slot: NaiveTime| {
        offset
            .from_local_datetime(&date.and_time(slot))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    };

    let today = slots
        .iter()
        .filter_map(|&slot| at(local_date, slot))
        .find(|candidate| *candidate > after);
    if today.is_some() {
        return today;
    }

    let tomorrow = local_date.checked_add_days(Days::new(1))?;
    slots.first().and_then(|&slot| at(tomorrow, slot))
}
