use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One log line attached to a task run. Ids increase monotonically within a
/// task, so readers can resume from the last id they saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub id: u64,
    pub task_id: u64,
    pub level: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
