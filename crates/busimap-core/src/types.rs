use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BusimapError, Result};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Defines when and how often a periodic job fires. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given instant.
    Once { at: DateTime<Utc> },

    /// Fire repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Fire every day at HH:MM.
    Daily { hour: u8, minute: u8 },

    /// Fire on a specific weekday (0 = Monday … 6 = Sunday) at HH:MM.
    Weekly { day: u8, hour: u8, minute: u8 },

    /// Cron expression, 5-field (`min hour dom mon dow`) or 6/7-field with seconds.
    Cron { expression: String },
}

impl Schedule {
    /// Reject field values that can never produce a fire time.
    ///
    /// Cron syntax is checked by the scheduler when the expression is parsed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err(BusimapError::InvalidSchedule(
                        "interval must be at least one second".into(),
                    ));
                }
                if interval_delta(*every_secs).is_none() {
                    return Err(BusimapError::InvalidSchedule(format!(
                        "interval of {every_secs}s is out of range"
                    )));
                }
                Ok(())
            }
            Schedule::Daily { hour, minute } => check_clock(*hour, *minute),
            Schedule::Weekly { day, hour, minute } => {
                if *day > 6 {
                    return Err(BusimapError::InvalidSchedule(format!(
                        "weekday {day} out of range 0..=6"
                    )));
                }
                check_clock(*hour, *minute)
            }
            Schedule::Cron { expression } => {
                if expression.trim().is_empty() {
                    return Err(BusimapError::InvalidSchedule("empty cron expression".into()));
                }
                Ok(())
            }
        }
    }
}

/// `every_secs` as a chrono duration, `None` when it does not fit.
pub fn interval_delta(every_secs: u64) -> Option<chrono::TimeDelta> {
    i64::try_from(every_secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
}

fn check_clock(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(BusimapError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} is not a valid UTC clock time"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Creation and last-update instants embedded in persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            updated_at: at,
        }
    }

    pub fn now() -> Self {
        Self::new(Utc::now())
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::now()
    }
}

/// Records that carry [`Timestamps`]. The persistence layer calls
/// [`Timestamped::touch`] on every write.
pub trait Timestamped {
    fn timestamps(&self) -> &Timestamps;
    fn timestamps_mut(&mut self) -> &mut Timestamps;

    fn touch(&mut self) {
        self.timestamps_mut().updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// SoftDelete
// ---------------------------------------------------------------------------

/// Reversible deletion marker. Irreversible removal is a separate explicit
/// `purge` call on whichever store owns the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Mark as deleted. Returns false if it already was.
    pub fn mark(&mut self, at: DateTime<Utc>) -> bool {
        if self.deleted_at.is_some() {
            return false;
        }
        self.deleted_at = Some(at);
        true
    }

    /// Clear the marker. Returns false if the record was not deleted.
    pub fn restore(&mut self) -> bool {
        self.deleted_at.take().is_some()
    }
}

/// Records that support two-phase deletion.
pub trait SoftDeletable {
    fn deletion(&self) -> &SoftDelete;
    fn deletion_mut(&mut self) -> &mut SoftDelete;

    fn is_deleted(&self) -> bool {
        self.deletion().is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_serde_uses_kind_tag() {
        let s: Schedule = serde_json::from_str(r#"{"kind":"interval","every_secs":60}"#).unwrap();
        assert_eq!(s, Schedule::Interval { every_secs: 60 });

        let json = serde_json::to_string(&Schedule::Cron {
            expression: "0 3 * * *".into(),
        })
        .unwrap();
        assert!(json.contains(r#""kind":"cron""#));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Schedule::Interval { every_secs: 0 }.validate().is_err());
        assert!(Schedule::Interval { every_secs: 1 }.validate().is_ok());
    }

    #[test]
    fn oversized_interval_is_rejected() {
        for every_secs in [10_000_000_000_000_000, u64::MAX] {
            let err = Schedule::Interval { every_secs }.validate().unwrap_err();
            assert_eq!(err.code(), "INVALID_SCHEDULE");
        }
        assert!(interval_delta(u64::MAX).is_none());
        assert_eq!(interval_delta(60), Some(chrono::TimeDelta::seconds(60)));
    }

    #[test]
    fn clock_fields_are_range_checked() {
        assert!(Schedule::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Schedule::Daily { hour: 23, minute: 59 }.validate().is_ok());
        assert!(Schedule::Weekly { day: 7, hour: 0, minute: 0 }.validate().is_err());
        assert!(Schedule::Cron { expression: "  ".into() }.validate().is_err());
    }

    #[test]
    fn soft_delete_is_reversible_once() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut d = SoftDelete::default();
        assert!(d.mark(at));
        assert!(!d.mark(at));
        assert!(d.is_deleted());
        assert!(d.restore());
        assert!(!d.restore());
        assert!(!d.is_deleted());
    }

    struct Record {
        ts: Timestamps,
    }

    impl Timestamped for Record {
        fn timestamps(&self) -> &Timestamps {
            &self.ts
        }
        fn timestamps_mut(&mut self) -> &mut Timestamps {
            &mut self.ts
        }
    }

    #[test]
    fn touch_moves_updated_at_only() {
        let past = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut r = Record {
            ts: Timestamps::new(past),
        };
        r.touch();
        assert_eq!(r.timestamps().created_at, past);
        assert!(r.timestamps().updated_at > past);
    }
}
