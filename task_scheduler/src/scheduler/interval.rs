use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Timelike};

use super::types::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        };
        f.write_str(label)
    }
}

impl FromStr for IntervalUnit {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "minutes" => Ok(IntervalUnit::Minutes),
            "hours" => Ok(IntervalUnit::Hours),
            "days" => Ok(IntervalUnit::Days),
            other => Err(SchedulerError::InvalidUnit(other.to_string())),
        }
    }
}

/// Next run instant aligned to clock boundaries, strictly after `now`,
/// with seconds and sub-seconds zeroed.
///
/// Minutes snap to the smallest multiple of `interval` greater than the
/// current minute, rolling to the top of the next hour past :59. Hours
/// snap to the top of the hour; days to midnight. Intervals that do not
/// divide the unit range evenly (7 minutes, say) produce a shorter gap
/// at rollover. That is the intended alignment behavior.
pub fn next_aligned(
    now: NaiveDateTime,
    interval: u32,
    unit: IntervalUnit,
) -> Result<NaiveDateTime, SchedulerError> {
    if interval == 0 {
        return Err(SchedulerError::ZeroInterval);
    }
    let day = now.date();

    let next = match unit {
        IntervalUnit::Minutes => {
            let next_minute = ((now.minute() / interval) + 1) * interval;
            if next_minute >= 60 {
                day.and_hms_opt(now.hour(), 0, 0)
                    .map(|hour_start| hour_start + Duration::hours(1))
            } else {
                day.and_hms_opt(now.hour(), next_minute, 0)
            }
        }
        IntervalUnit::Hours => {
            let next_hour = now
                .hour()
                .checked_add(interval)
                .ok_or(SchedulerError::TimeOutOfRange)?;
            if next_hour >= 24 {
                (day + Duration::days(1)).and_hms_opt(next_hour % 24, 0, 0)
            } else {
                day.and_hms_opt(next_hour, 0, 0)
            }
        }
        IntervalUnit::Days => day
            .checked_add_signed(Duration::days(i64::from(interval)))
            .and_then(|future| future.and_hms_opt(0, 0, 0)),
    };

    next.ok_or(SchedulerError::TimeOutOfRange)
}
