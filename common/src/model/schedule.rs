use std::str::FromStr;

use chrono::Duration;
use errors::{Result, SchedulerError};
use serde::{Deserialize, Serialize};

/// Schedule options for a scraper. A scraper never has two concurrent runs,
/// so a fire that overlaps an active task is skipped, not queued behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Scraper is not scheduled automatically.
    #[default]
    Inactive,
    EverySecond,
    EveryMinute,
    EveryHour,
    EveryDay,
    EveryWeek,
    EveryMonth,
    /// Fire times come from `schedule_crontab`.
    Crontab,
}

impl Schedule {
    /// Fixed interval between fires, when the schedule is interval based.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Inactive | Schedule::Crontab => None,
            Schedule::EverySecond => Some(Duration::seconds(1)),
            Schedule::EveryMinute => Some(Duration::minutes(1)),
            Schedule::EveryHour => Some(Duration::hours(1)),
            Schedule::EveryDay => Some(Duration::days(1)),
            Schedule::EveryWeek => Some(Duration::weeks(1)),
            Schedule::EveryMonth => Some(Duration::days(30)),
        }
    }

    pub fn all() -> &'static [Schedule] {
        &[
            Schedule::Inactive,
            Schedule::EverySecond,
            Schedule::EveryMinute,
            Schedule::EveryHour,
            Schedule::EveryDay,
            Schedule::EveryWeek,
            Schedule::EveryMonth,
            Schedule::Crontab,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Inactive => "inactive",
            Schedule::EverySecond => "every_second",
            Schedule::EveryMinute => "every_minute",
            Schedule::EveryHour => "every_hour",
            Schedule::EveryDay => "every_day",
            Schedule::EveryWeek => "every_week",
            Schedule::EveryMonth => "every_month",
            Schedule::Crontab => "crontab",
        }
    }
}

/// Parses a crontab expression into a [`cron::Schedule`].
///
/// Accepts the standard 5-field form; the `cron` crate wants a seconds
/// field, so 5-field expressions are pinned to second zero.
pub fn parse_crontab(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|_| SchedulerError::InvalidCrontab(expr.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_field_crontab() {
        let schedule = parse_crontab("*/5 * * * *").unwrap();
        assert!(schedule.upcoming(chrono::Utc).next().is_some());
    }

    #[test]
    fn test_invalid_crontab() {
        let err = parse_crontab("not a crontab").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_intervals() {
        assert_eq!(Schedule::EveryMinute.interval(), Some(Duration::minutes(1)));
        assert_eq!(Schedule::Inactive.interval(), None);
        assert_eq!(Schedule::Crontab.interval(), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Schedule::EveryMinute).unwrap();
        assert_eq!(json, "\"every_minute\"");
    }
}
