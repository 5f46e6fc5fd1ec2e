use std::time::Duration;

use async_trait::async_trait;
use errors::Result;
use uuid::Uuid;

use crate::model::{Lease, LogLine, Priority, Scraper, SearchFilters, Task};

/// Persistence for scraper definitions.
///
/// All mutations fail with `ReadOnly` when the storage is read-only.
#[async_trait]
pub trait ScraperStorage: Send + Sync {
    fn is_read_only(&self) -> bool;

    async fn list(&self) -> Result<Vec<Scraper>>;

    /// Fails with `NotFound` when the scraper does not exist.
    async fn get(&self, id: Uuid) -> Result<Scraper>;

    /// Absence is not an error.
    async fn maybe_get(&self, id: Uuid) -> Result<Option<Scraper>>;

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<Scraper>>;

    async fn create(&self, scraper: Scraper) -> Result<Scraper>;

    async fn update(&self, scraper: Scraper) -> Result<Scraper>;

    async fn delete(&self, id: Uuid) -> Result<Scraper>;
}

/// Durable task queue storage.
///
/// The dequeue contract is the heart of the queue: scan the given
/// priorities in order and hand out the oldest pending task of the highest
/// non-empty priority, atomically flipping it to `Started` and stamping
/// `started_at`/`last_active_at`. A crash can never leave a task both
/// pending and owned.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Allocates the next task id; ids increase monotonically.
    async fn next_task_id(&self) -> Result<u64>;

    async fn enqueue(&self, task: Task) -> Result<Task>;

    async fn dequeue(&self, priorities: &[Priority]) -> Result<Option<Task>>;

    /// Fails with `NotFound` when the task does not exist.
    async fn update(&self, task: Task) -> Result<Task>;

    async fn get(&self, task_id: u64) -> Result<Task>;

    /// Task history for one scraper key, newest first.
    async fn list_by_scraper(&self, scraper_key: &str) -> Result<Vec<Task>>;

    /// All tasks currently `Pending` or `Started`.
    async fn list_active(&self) -> Result<Vec<Task>>;

    /// Keeps the `retention` newest terminal tasks per scraper and deletes
    /// the rest, returning the deleted ids so callers can drop their logs.
    async fn delete_old(&self, retention: usize) -> Result<Vec<u64>>;

    async fn pending_count(&self, priority: Priority) -> Result<u64>;
}

/// Global lock storage backing scheduler leadership.
#[async_trait]
pub trait LeaseStorage: Send + Sync {
    /// Acquires or renews the lease. Succeeds iff the lease is unowned,
    /// expired, or already held by `owner`.
    async fn maybe_acquire(&self, name: &str, owner: Uuid, ttl: Duration)
        -> Result<Option<Lease>>;

    /// Releases the lease when held by `owner`; otherwise a no-op.
    async fn release(&self, name: &str, owner: Uuid) -> Result<()>;
}

/// Per-task log lines.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Appends a line, assigning the next monotonic id within the task.
    async fn append(&self, task_id: u64, level: &str, message: &str) -> Result<LogLine>;

    /// Lines with id greater than `after_id`, oldest first, at most
    /// `max_lines` of them.
    async fn read(&self, task_id: u64, after_id: Option<u64>, max_lines: usize)
        -> Result<Vec<LogLine>>;

    async fn delete(&self, task_id: u64) -> Result<()>;
}
