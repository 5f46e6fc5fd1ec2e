use std::sync::Arc;

use log::warn;

use crate::interface::LogStorage;

/// Log sink bound to one task. Lines go to the log storage for the UI and
/// are mirrored onto the process log. Storage failures are swallowed after
/// a warning so logging can never fail a scrape.
#[derive(Clone)]
pub struct TaskLogger {
    storage: Arc<dyn LogStorage>,
    task_id: u64,
}

impl TaskLogger {
    pub fn new(storage: Arc<dyn LogStorage>, task_id: u64) -> Self {
        TaskLogger { storage, task_id }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub async fn log(&self, level: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        if let Err(e) = self.storage.append(self.task_id, level, message).await {
            warn!("failed to persist log line for task {}: {}", self.task_id, e);
        }
    }

    pub async fn debug(&self, message: impl AsRef<str>) {
        self.log("debug", message).await;
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.log("info", message).await;
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.log("warn", message).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.log("error", message).await;
    }
}
