// Next daily occurrence calculation
//
// The daily update time is a wall-clock time without timezone, interpreted in
// the timezone of the reference instant (the host's local time in production).

use crate::errors::ScheduleError;
use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, TimeZone};
use std::time::Duration;

/// Days probed past the first candidate date before giving up. Only a
/// timezone transition that skips the target wall-clock time on several
/// consecutive days could exhaust this.
const MAX_PROBED_DAYS: u32 = 3;

/// Resolve the next instant strictly after `reference` whose time-of-day is
/// exactly `target`.
///
/// If `reference` is strictly before `target` on its own date, that date is
/// used; otherwise (including exact equality) the following calendar date.
pub fn resolve_next_run<Tz: TimeZone>(
    target: NaiveTime,
    reference: &DateTime<Tz>,
) -> Result<DateTime<Tz>, ScheduleError> {
    let local = reference.naive_local();
    let tz = reference.timezone();

    let mut date = if local.time() < target {
        Some(local.date())
    } else {
        local.date().succ_opt()
    };

    for _ in 0..=MAX_PROBED_DAYS {
        let Some(day) = date else { break };
        if let Some(next) = occurrence_after(&tz, day, target, reference) {
            return Ok(next);
        }
        date = day.succ_opt();
    }

    Err(ScheduleError::NoNextOccurrence {
        target: target.to_string(),
        reference: local.to_string(),
    })
}

/// Map `day` at `target` into the zone, keeping only instants after `reference`
fn occurrence_after<Tz: TimeZone>(
    tz: &Tz,
    day: NaiveDate,
    target: NaiveTime,
    reference: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&day.and_time(target)) {
        LocalResult::Single(dt) => Some(dt).filter(|dt| dt > reference),
        LocalResult::Ambiguous(earliest, latest) => [earliest, latest]
            .into_iter()
            .find(|dt| dt > reference),
        // Wall-clock time skipped by a transition on this day
        LocalResult::None => None,
    }
}

/// Delay from `now` until `next`, zero if `next` is not in the future
pub fn delay_until<Tz: TimeZone>(next: &DateTime<Tz>, now: &DateTime<Tz>) -> Duration {
    next.clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
