use std::time::Duration;

use errors::{Error, Result, SchedulerError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::config::ScraperConfig;
use crate::model::priority::Priority;
use crate::model::schedule::{parse_crontab, Schedule};

/// Persisted scraper definition binding a handler to a schedule and config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scraper {
    pub id: Uuid,
    pub name: String,
    /// Name of the registered handler implementing the scrape logic.
    pub handler: String,
    #[serde(default)]
    pub config: ScraperConfig,
    #[serde(default)]
    pub schedule: Schedule,
    /// Present iff `schedule` is `Crontab`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_crontab: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Opaque state blob the handler may persist between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Per-job timeout; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Scraper {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Checks structural invariants: crontab presence and well-formedness.
    pub fn validate(&self) -> Result<()> {
        match self.schedule {
            Schedule::Crontab => {
                let expr = self
                    .schedule_crontab
                    .as_deref()
                    .ok_or(Error::from(SchedulerError::MissingCrontab))?;
                parse_crontab(expr)?;
            }
            _ => {
                if self.schedule_crontab.is_some() {
                    return Err(Error::validation(
                        "schedule_crontab is only valid with the crontab schedule",
                    ));
                }
            }
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation("scraper name must not be empty"));
        }
        if self.handler.trim().is_empty() {
            return Err(Error::validation("scraper handler must not be empty"));
        }
        Ok(())
    }
}

/// Payload for creating a scraper; the server assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScraperRequest {
    pub name: String,
    pub handler: String,
    #[serde(default)]
    pub config: ScraperConfig,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub schedule_crontab: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl CreateScraperRequest {
    pub fn into_scraper(self) -> Scraper {
        Scraper {
            id: Uuid::now_v7(),
            name: self.name,
            handler: self.handler,
            config: self.config,
            schedule: self.schedule,
            schedule_crontab: self.schedule_crontab,
            priority: self.priority,
            state: None,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Filters for scraper search; pagination continues after `last_seen_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub name_filter: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub last_seen_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scraper(schedule: Schedule, crontab: Option<&str>) -> Scraper {
        Scraper {
            id: Uuid::now_v7(),
            name: "news".into(),
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            schedule,
            schedule_crontab: crontab.map(Into::into),
            priority: Priority::Normal,
            state: None,
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_crontab_required() {
        let err = scraper(Schedule::Crontab, None).validate().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_crontab_validated() {
        assert!(scraper(Schedule::Crontab, Some("0 * * * *")).validate().is_ok());
        assert!(scraper(Schedule::Crontab, Some("bogus")).validate().is_err());
    }

    #[test]
    fn test_crontab_rejected_for_interval_schedule() {
        let err = scraper(Schedule::EveryHour, Some("0 * * * *"))
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_create_request_assigns_id() {
        let request = CreateScraperRequest {
            name: "news".into(),
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            schedule: Schedule::EveryHour,
            schedule_crontab: None,
            priority: Priority::High,
            timeout_seconds: Some(120),
        };
        let scraper = request.into_scraper();
        assert_eq!(scraper.priority, Priority::High);
        assert_eq!(scraper.timeout(), Some(Duration::from_secs(120)));
    }
}
