use std::str::FromStr;

use busimap_core::types::{interval_delta, Schedule};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// Compute the next UTC fire time for `schedule` strictly after `from`.
///
/// Returns `None` once the schedule is exhausted (a `Once` job whose instant
/// is not in the future) or the next time falls outside chrono's range.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => {
            interval_delta(*every_secs).and_then(|d| from.checked_add_signed(d))
        }

        Schedule::Daily { hour, minute } => {
            let candidate = at_clock(from, 0, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            // 0 = Monday, matching chrono's `num_days_from_monday`.
            let today = from.weekday().num_days_from_monday() as i64;
            let ahead = (*day as i64 - today).rem_euclid(7);
            let candidate = at_clock(from, ahead, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(7))
            }
        }

        Schedule::Cron { expression } => match parse_cron(expression) {
            Ok(cron) => cron.after(&from).next(),
            Err(e) => {
                warn!(%expression, "unparseable cron expression: {e}");
                None
            }
        },
    }
}

/// First fire time when a periodic job is armed at `now`.
///
/// Interval jobs fire on the first tick; everything else waits for its next
/// calendar occurrence. A `Once` instant already in the past is never fired.
pub fn first_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { .. } => Some(now),
        Schedule::Once { at } => (*at >= now).then_some(*at),
        other => compute_next_run(other, now),
    }
}

/// Parse a cron expression, accepting the 5-field form
/// (`min hour dom mon dow`) as well as the 6/7-field form with seconds.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron(expression))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
}

/// Fully check a schedule, including cron syntax.
pub fn validate(schedule: &Schedule) -> Result<()> {
    schedule.validate()?;
    if let Schedule::Cron { expression } = schedule {
        parse_cron(expression)?;
    }
    Ok(())
}

fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn at_clock(from: DateTime<Utc>, days_ahead: i64, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    let date = from.checked_add_signed(Duration::days(days_ahead))?.date_naive();
    let time = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)?;
    Utc.from_local_datetime(&date.and_time(time)).single()
}
