//! Schedule expressions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use flowgate_core::parse_duration;
use flowgate_store::Timestamp;

use crate::error::SchedulerError;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// When a workflow is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Exactly one run, ever.
    Once,
    /// One run per period.
    Every(Duration),
}

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let every = |secs: u64| -> Result<Self, SchedulerError> {
            Ok(Schedule::Every(Duration::from_secs(secs)))
        };
        match s {
            "@once" => Ok(Schedule::Once),
            "@hourly" => every(HOUR),
            "@daily" => every(DAY),
            "@weekly" => every(7 * DAY),
            _ => match parse_duration(s) {
                Some(d) if d.as_secs() >= 1 => Ok(Schedule::Every(d)),
                _ => Err(SchedulerError::UnsupportedSchedule(s.to_string())),
            },
        }
    }
}

impl Schedule {
    /// Whether a new run is due at `now`, given the last run's logical time.
    ///
    /// Missed periods are not caught up: at most one run is due.
    pub fn is_due(&self, last_run: Option<Timestamp>, now: Timestamp) -> bool {
        match (self, last_run) {
            (_, None) => true,
            (Schedule::Once, Some(_)) => false,
            (Schedule::Every(period), Some(last)) => {
                now.saturating_sub(last) >= period.as_secs() as Timestamp
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Once => f.write_str("@once"),
            Schedule::Every(d) => write!(f, "every {}", flowgate_core::format_duration(*d)),
        }
    }
}
