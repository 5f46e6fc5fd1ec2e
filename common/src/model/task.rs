use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::config::ScraperConfig;
use crate::model::priority::Priority;

/// Scraper key used for tasks that are not linked to a persisted scraper.
pub const EPHEMERAL_SCRAPER_KEY: &str = "ephemeral";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is in the queue.
    Pending,
    /// Task was dequeued and is being processed by a worker.
    Started,
    Succeeded,
    Failed,
    /// Worker stopped heartbeating, so the reaper wrote the task off.
    Dead,
    /// Task was killed on request.
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Dead | TaskStatus::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
            TaskStatus::Killed => "killed",
        }
    }
}

/// A single queued or executing run of a handler.
///
/// Handler name and config are captured at enqueue time and immutable
/// afterwards; a scraper edit never affects an in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    /// `None` for ephemeral runs.
    pub scraper_id: Option<Uuid>,
    pub handler: String,
    #[serde(default)]
    pub config: ScraperConfig,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Handler result or failure description; meaningful only once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Started)
    }

    /// Key grouping tasks by their scraper; ephemeral tasks share one bucket.
    pub fn scraper_key(&self) -> String {
        self.scraper_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| EPHEMERAL_SCRAPER_KEY.to_string())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Latest activity signal, falling back through start and creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_active_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}

/// Enqueue request; the queue assigns id, status and creation stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub scraper_id: Option<Uuid>,
    pub handler: String,
    #[serde(default)]
    pub config: ScraperConfig,
    pub priority: Priority,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl EnqueueRequest {
    pub fn into_task(self, id: u64, now: DateTime<Utc>) -> Task {
        Task {
            id,
            scraper_id: self.scraper_id,
            handler: self.handler,
            config: self.config,
            priority: self.priority,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            last_active_at: None,
            finished_at: None,
            result: None,
            timeout_seconds: self.timeout_seconds,
        }
    }
}
