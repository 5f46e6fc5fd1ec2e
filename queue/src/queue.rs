use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use errors::{Error, QueueError, Result};
use log::{debug, info};
use metrics::counter;

use common::interface::QueueStorage;
use common::model::{EnqueueRequest, Priority, Task, TaskStatus};
use utils::retry::{with_retries, DEFAULT_ATTEMPTS};

/// A started task whose worker has been silent for this long is written off
/// as dead by the reaper (5x the worker heartbeat interval).
pub const DEFAULT_DEAD_THRESHOLD: Duration = Duration::from_secs(25);

/// How many terminal tasks to keep per scraper when trimming history.
pub const DEFAULT_RETENTION: usize = 50;

/// Priority task queue over a storage backend.
///
/// Strict priority with FIFO inside a class, and at most one active task
/// per scraper: an enqueue for a scraper that already has a pending or
/// started task is rejected with `TaskActive`.
pub struct Queue {
    storage: Arc<dyn QueueStorage>,
}

impl Queue {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Queue { storage }
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Task> {
        if let Some(scraper_id) = request.scraper_id {
            let key = scraper_id.to_string();
            let existing = with_retries("queue.list_by_scraper", DEFAULT_ATTEMPTS, || {
                self.storage.list_by_scraper(&key)
            })
            .await?;
            if existing.iter().any(|t| t.is_active()) {
                return Err(Error::task_active());
            }
        }

        let id = with_retries("queue.next_task_id", DEFAULT_ATTEMPTS, || {
            self.storage.next_task_id()
        })
        .await?;
        let task = request.into_task(id, Utc::now());
        let task = with_retries("queue.enqueue", DEFAULT_ATTEMPTS, || {
            self.storage.enqueue(task.clone())
        })
        .await?;
        counter!("queue_enqueued_total", "priority" => task.priority.suffix()).increment(1);
        debug!("enqueued task id={} handler={}", task.id, task.handler);
        Ok(task)
    }

    /// Non-blocking; `None` when no task is pending.
    pub async fn dequeue(&self) -> Result<Option<Task>> {
        let task = with_retries("queue.dequeue", DEFAULT_ATTEMPTS, || {
            self.storage.dequeue(&Priority::DEQUEUE_ORDER)
        })
        .await?;
        if let Some(task) = &task {
            counter!("queue_dequeued_total", "priority" => task.priority.suffix()).increment(1);
        }
        Ok(task)
    }

    /// Heartbeat: stamps `last_active_at` on a started task.
    pub async fn ping(&self, task_id: u64) -> Result<Task> {
        let mut task = self.get_task(task_id).await?;
        match task.status {
            TaskStatus::Pending => return Err(QueueError::PingNotStarted.into()),
            TaskStatus::Started => {}
            _ => return Err(QueueError::PingFinished.into()),
        }
        task.last_active_at = Some(Utc::now());
        match self.storage.update(task).await {
            Ok(task) => Ok(task),
            // The task went terminal between the read and the write; the
            // worker must treat this exactly like pinging a finished task.
            Err(e) if e.is_terminal_task() => Err(QueueError::PingFinished.into()),
            Err(e) => Err(e),
        }
    }

    /// Kills a task. Pending tasks die immediately and are skimmed off the
    /// queue on the next dequeue; started tasks flip to `Killed` so the
    /// owning worker's next heartbeat cancels its handler.
    pub async fn kill(&self, task_id: u64) -> Result<Task> {
        let mut task = self.get_task(task_id).await?;
        if task.is_terminal() {
            return Err(QueueError::TerminalTask.into());
        }
        task.status = TaskStatus::Killed;
        task.finished_at = Some(Utc::now());
        task.result = Some("task was killed on request".to_string());
        let task = self.storage.update(task).await?;
        counter!("tasks_total", "status" => "killed").increment(1);
        info!("killed task id={}", task.id);
        Ok(task)
    }

    /// Reaper sweep: transitions started tasks whose last activity is older
    /// than `threshold` to `Dead`. Dead tasks are not retried automatically.
    pub async fn mark_dead(&self, threshold: Duration) -> Result<Vec<Task>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(25));
        let active = self.storage.list_active().await?;
        let mut dead = Vec::new();
        for mut task in active {
            if task.status != TaskStatus::Started {
                continue;
            }
            if now - task.last_activity() <= threshold {
                continue;
            }
            task.status = TaskStatus::Dead;
            task.finished_at = Some(now);
            task.result = Some(format!(
                "worker stopped heartbeating (last activity at {})",
                task.last_activity().to_rfc3339()
            ));
            match self.storage.update(task).await {
                Ok(task) => {
                    counter!("tasks_total", "status" => "dead").increment(1);
                    info!("marked task id={} as dead", task.id);
                    dead.push(task);
                }
                // Lost the race against the worker finishing; leave it be.
                Err(e) if e.is_terminal_task() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(dead)
    }

    /// Trims per-scraper history to the `retention` newest terminal tasks,
    /// returning the ids of deleted tasks so their logs can be dropped too.
    pub async fn delete_old(&self, retention: usize) -> Result<Vec<u64>> {
        self.storage.delete_old(retention).await
    }

    pub async fn pending_count(&self, priority: Priority) -> Result<u64> {
        self.storage.pending_count(priority).await
    }

    /// Number of tasks currently being executed somewhere in the fleet.
    pub async fn active_count(&self) -> Result<u64> {
        let active = self.storage.list_active().await?;
        Ok(active
            .iter()
            .filter(|t| t.status == TaskStatus::Started)
            .count() as u64)
    }

    pub async fn get_task(&self, task_id: u64) -> Result<Task> {
        with_retries("queue.get", DEFAULT_ATTEMPTS, || self.storage.get(task_id)).await
    }

    pub async fn list_by_scraper(&self, scraper_key: &str) -> Result<Vec<Task>> {
        self.storage.list_by_scraper(scraper_key).await
    }

    pub async fn update(&self, task: Task) -> Result<Task> {
        with_retries("queue.update", DEFAULT_ATTEMPTS, || {
            self.storage.update(task.clone())
        })
        .await
    }
}
