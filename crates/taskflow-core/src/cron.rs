//! Cron schedule evaluation
//!
//! Definitions use standard 5-field cron expressions (minute, hour,
//! day-of-month, month, day-of-week), evaluated in UTC. The underlying
//! crate wants a seconds field and only iterates forward, so this wrapper
//! prepends the seconds field and finds previous occurrences by scanning
//! forward from a widening look-back window.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("cron expression `{0}` must have 5 fields (min hour dom month dow)")]
    FieldCount(String),

    #[error("invalid cron expression `{expr}`: {source}")]
    Invalid {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
}

/// A parsed recurring schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

// Look-back horizons for `prev_fire`, smallest first. The widest horizon
// covers schedules that fire less than yearly (e.g. Feb 29).
const LOOKBACK_DAYS: [i64; 5] = [1, 8, 35, 370, 1500];

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();
        if trimmed.split_whitespace().count() != 5 {
            return Err(ScheduleError::FieldCount(trimmed.to_string()));
        }
        let with_seconds = format!("0 {trimmed}");
        let schedule = Schedule::from_str(&with_seconds).map_err(|source| {
            ScheduleError::Invalid {
                expr: trimmed.to_string(),
                source,
            }
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    /// The original 5-field expression.
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Next fire time strictly after `base`.
    pub fn next_fire(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&base).next()
    }

    /// Most recent fire time at or before `base`.
    pub fn prev_fire(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for days in LOOKBACK_DAYS {
            let start = base - Duration::days(days);
            let mut prev = None;
            for fire in self.schedule.after(&start) {
                if fire > base {
                    break;
                }
                prev = Some(fire);
            }
            if prev.is_some() {
                return prev;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(matches!(
            CronSchedule::parse("0 6 * *"),
            Err(ScheduleError::FieldCount(_))
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 6 * * *"),
            Err(ScheduleError::FieldCount(_))
        ));
        assert!(matches!(
            CronSchedule::parse("61 6 * * *"),
            Err(ScheduleError::Invalid { .. })
        ));
    }

    #[test]
    fn next_fire_is_strictly_after_base() {
        let schedule = CronSchedule::parse("0 6 * * *").unwrap();

        // exactly on a slot: the next fire is the following day
        assert_eq!(
            schedule.next_fire(utc(2017, 6, 3, 6, 0, 0)),
            Some(utc(2017, 6, 4, 6, 0, 0))
        );
        // just before a slot
        assert_eq!(
            schedule.next_fire(utc(2017, 6, 3, 5, 59, 59)),
            Some(utc(2017, 6, 3, 6, 0, 0))
        );
    }

    #[test]
    fn prev_fire_includes_base_when_it_matches() {
        let schedule = CronSchedule::parse("0 6 * * *").unwrap();

        assert_eq!(
            schedule.prev_fire(utc(2017, 6, 3, 6, 0, 0)),
            Some(utc(2017, 6, 3, 6, 0, 0))
        );
        assert_eq!(
            schedule.prev_fire(utc(2017, 6, 3, 5, 59, 0)),
            Some(utc(2017, 6, 2, 6, 0, 0))
        );
    }

    #[test]
    fn prev_fire_spans_sparse_schedules() {
        // fires once a year
        let schedule = CronSchedule::parse("30 4 1 1 *").unwrap();
        assert_eq!(
            schedule.prev_fire(utc(2017, 6, 3, 0, 0, 0)),
            Some(utc(2017, 1, 1, 4, 30, 0))
        );
    }

    #[test]
    fn minutely_schedule_round_trip() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let base = utc(2017, 6, 3, 6, 2, 11);
        assert_eq!(schedule.next_fire(base), Some(utc(2017, 6, 3, 6, 5, 0)));
        assert_eq!(schedule.prev_fire(base), Some(utc(2017, 6, 3, 6, 0, 0)));
    }
}
