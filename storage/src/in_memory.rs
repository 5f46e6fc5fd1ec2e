//! Single-process storage backends for development and tests. One mutex per
//! backend keeps dequeue linearizable without any further coordination.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use errors::{Error, QueueError, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use common::interface::{LeaseStorage, LogStorage, QueueStorage, ScraperStorage};
use common::model::{Lease, LogLine, Priority, Scraper, SearchFilters, Task, TaskStatus};

#[derive(Default)]
pub struct InMemoryScraperStorage {
    read_only: bool,
    scrapers: Mutex<HashMap<Uuid, Scraper>>,
}

impl InMemoryScraperStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scrapers(scrapers: Vec<Scraper>, read_only: bool) -> Self {
        InMemoryScraperStorage {
            read_only,
            scrapers: Mutex::new(scrapers.into_iter().map(|s| (s.id, s)).collect()),
        }
    }
}

#[async_trait]
impl ScraperStorage for InMemoryScraperStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn list(&self) -> Result<Vec<Scraper>> {
        let scrapers = self.scrapers.lock().await;
        let mut all: Vec<Scraper> = scrapers.values().cloned().collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }

    async fn get(&self, id: Uuid) -> Result<Scraper> {
        self.maybe_get(id).await?.ok_or_else(Error::not_found)
    }

    async fn maybe_get(&self, id: Uuid) -> Result<Option<Scraper>> {
        Ok(self.scrapers.lock().await.get(&id).cloned())
    }

    async fn search(&self, filters: &SearchFilters) -> Result<Vec<Scraper>> {
        let mut all = self.list().await?;
        if let Some(last_seen) = filters.last_seen_id {
            all.retain(|s| s.id > last_seen);
        }
        if let Some(name_filter) = &filters.name_filter {
            let needle = name_filter.to_lowercase();
            all.retain(|s| s.name.to_lowercase().contains(&needle));
        }
        if let Some(max_items) = filters.max_items {
            all.truncate(max_items);
        }
        Ok(all)
    }

    async fn create(&self, scraper: Scraper) -> Result<Scraper> {
        if self.read_only {
            return Err(Error::read_only());
        }
        let mut scrapers = self.scrapers.lock().await;
        scrapers.insert(scraper.id, scraper.clone());
        Ok(scraper)
    }

    async fn update(&self, scraper: Scraper) -> Result<Scraper> {
        if self.read_only {
            return Err(Error::read_only());
        }
        let mut scrapers = self.scrapers.lock().await;
        if !scrapers.contains_key(&scraper.id) {
            return Err(Error::not_found());
        }
        scrapers.insert(scraper.id, scraper.clone());
        Ok(scraper)
    }

    async fn delete(&self, id: Uuid) -> Result<Scraper> {
        if self.read_only {
            return Err(Error::read_only());
        }
        let mut scrapers = self.scrapers.lock().await;
        scrapers.remove(&id).ok_or_else(Error::not_found)
    }
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    pending: HashMap<Priority, VecDeque<u64>>,
    tasks: HashMap<u64, Task>,
    by_scraper: HashMap<String, Vec<u64>>,
}

#[derive(Default)]
pub struct InMemoryQueueStorage {
    inner: Mutex<QueueInner>,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn next_task_id(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    async fn enqueue(&self, task: Task) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        inner
            .pending
            .entry(task.priority)
            .or_default()
            .push_back(task.id);
        inner
            .by_scraper
            .entry(task.scraper_key())
            .or_default()
            .push(task.id);
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn dequeue(&self, priorities: &[Priority]) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        for priority in priorities {
            loop {
                let id = match inner.pending.get_mut(priority).and_then(|q| q.pop_front()) {
                    Some(id) => id,
                    None => break,
                };
                // Ids of tasks killed while pending linger in the queue;
                // skim past anything that is no longer pending.
                if let Some(task) = inner.tasks.get_mut(&id) {
                    if task.status == TaskStatus::Pending {
                        let now = Utc::now();
                        task.status = TaskStatus::Started;
                        task.started_at = Some(now);
                        task.last_active_at = Some(now);
                        return Ok(Some(task.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn update(&self, task: Task) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or(Error::from(QueueError::TaskNotFound))?;
        if stored.is_terminal() && stored.status != task.status {
            return Err(QueueError::TerminalTask.into());
        }
        *stored = task.clone();
        Ok(task)
    }

    async fn get(&self, task_id: u64) -> Result<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(Error::from(QueueError::TaskNotFound))
    }

    async fn list_by_scraper(&self, scraper_key: &str) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .by_scraper
            .get(scraper_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    async fn list_active(&self) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn delete_old(&self, retention: usize) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock().await;
        let mut deleted = Vec::new();
        let keys: Vec<String> = inner.by_scraper.keys().cloned().collect();
        for key in keys {
            let ids = inner.by_scraper.get(&key).cloned().unwrap_or_default();
            let mut terminal: Vec<&Task> = ids
                .iter()
                .filter_map(|id| inner.tasks.get(id))
                .filter(|t| t.is_terminal())
                .collect();
            terminal.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            let stale: Vec<u64> = terminal.iter().skip(retention).map(|t| t.id).collect();
            for id in &stale {
                inner.tasks.remove(id);
            }
            if let Some(ids) = inner.by_scraper.get_mut(&key) {
                ids.retain(|id| !stale.contains(id));
            }
            deleted.extend(stale);
        }
        Ok(deleted)
    }

    async fn pending_count(&self, priority: Priority) -> Result<u64> {
        let inner = self.inner.lock().await;
        let count = inner
            .pending
            .get(&priority)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|id| {
                        inner
                            .tasks
                            .get(id)
                            .map(|t| t.status == TaskStatus::Pending)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }
}

#[derive(Default)]
pub struct InMemoryLeaseStorage {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn can_acquire(leases: &HashMap<String, Lease>, name: &str, owner: Uuid) -> bool {
        match leases.get(name) {
            None => true,
            Some(lease) => lease.is_expired(Utc::now()) || lease.owner == owner,
        }
    }
}

#[async_trait]
impl LeaseStorage for InMemoryLeaseStorage {
    async fn maybe_acquire(
        &self,
        name: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut leases = self.leases.lock().await;
        if !Self::can_acquire(&leases, name, owner) {
            return Ok(None);
        }
        let now = Utc::now();
        let lease = Lease {
            name: name.to_string(),
            owner,
            acquired_at: now,
            acquired_until: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, name: &str, owner: Uuid) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get(name) {
            if lease.owner == owner {
                leases.remove(name);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLogStorage {
    logs: Mutex<HashMap<u64, Vec<LogLine>>>,
}

impl InMemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStorage for InMemoryLogStorage {
    async fn append(&self, task_id: u64, level: &str, message: &str) -> Result<LogLine> {
        let mut logs = self.logs.lock().await;
        let lines = logs.entry(task_id).or_default();
        let line = LogLine {
            id: lines.len() as u64 + 1,
            task_id,
            level: level.to_string(),
            timestamp: Utc::now(),
            message: message.to_string(),
        };
        lines.push(line.clone());
        Ok(line)
    }

    async fn read(
        &self,
        task_id: u64,
        after_id: Option<u64>,
        max_lines: usize,
    ) -> Result<Vec<LogLine>> {
        let logs = self.logs.lock().await;
        let after = after_id.unwrap_or(0);
        Ok(logs
            .get(&task_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|line| line.id > after)
                    .take(max_lines)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, task_id: u64) -> Result<()> {
        self.logs.lock().await.remove(&task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{EnqueueRequest, ScraperConfig};

    fn request(priority: Priority) -> EnqueueRequest {
        EnqueueRequest {
            scraper_id: None,
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            priority,
            timeout_seconds: None,
        }
    }

    async fn enqueue(storage: &InMemoryQueueStorage, priority: Priority) -> Task {
        let id = storage.next_task_id().await.unwrap();
        let task = request(priority).into_task(id, Utc::now());
        storage.enqueue(task).await.unwrap()
    }

    #[tokio::test]
    async fn test_strict_priority_order() {
        let storage = InMemoryQueueStorage::new();
        let normal = enqueue(&storage, Priority::Normal).await;
        let utmost = enqueue(&storage, Priority::Utmost).await;
        let high = enqueue(&storage, Priority::High).await;

        let order = Priority::DEQUEUE_ORDER;
        let first = storage.dequeue(&order).await.unwrap().unwrap();
        let second = storage.dequeue(&order).await.unwrap().unwrap();
        let third = storage.dequeue(&order).await.unwrap().unwrap();
        assert_eq!(first.id, utmost.id);
        assert_eq!(second.id, high.id);
        assert_eq!(third.id, normal.id);
        assert!(storage.dequeue(&order).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let storage = InMemoryQueueStorage::new();
        let first = enqueue(&storage, Priority::Normal).await;
        let second = enqueue(&storage, Priority::Normal).await;

        let got = storage
            .dequeue(&Priority::DEQUEUE_ORDER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, first.id);
        let got = storage
            .dequeue(&Priority::DEQUEUE_ORDER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, second.id);
    }

    #[tokio::test]
    async fn test_dequeue_stamps_and_transitions() {
        let storage = InMemoryQueueStorage::new();
        enqueue(&storage, Priority::Normal).await;
        let task = storage
            .dequeue(&Priority::DEQUEUE_ORDER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert!(task.started_at.is_some());
        assert_eq!(task.started_at, task.last_active_at);
        assert!(task.created_at <= task.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_skips_killed_pending_task() {
        let storage = InMemoryQueueStorage::new();
        let mut task = enqueue(&storage, Priority::Normal).await;
        task.status = TaskStatus::Killed;
        task.finished_at = Some(Utc::now());
        storage.update(task).await.unwrap();
        assert!(storage
            .dequeue(&Priority::DEQUEUE_ORDER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_immutable() {
        let storage = InMemoryQueueStorage::new();
        let mut task = enqueue(&storage, Priority::Normal).await;
        task.status = TaskStatus::Succeeded;
        let task = storage.update(task).await.unwrap();

        let mut revived = task.clone();
        revived.status = TaskStatus::Started;
        let err = storage.update(revived).await.unwrap_err();
        assert!(err.is_terminal_task());
    }

    #[tokio::test]
    async fn test_delete_old_keeps_retention_newest() {
        let storage = InMemoryQueueStorage::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut task = enqueue(&storage, Priority::Normal).await;
            task.status = TaskStatus::Succeeded;
            task.finished_at = Some(Utc::now());
            ids.push(storage.update(task).await.unwrap().id);
        }
        let deleted = storage.delete_old(2).await.unwrap();
        assert_eq!(deleted.len(), 3);
        let remaining = storage.list_by_scraper("ephemeral").await.unwrap();
        assert_eq!(remaining.len(), 2);
        // Newest two survive.
        assert!(remaining.iter().all(|t| t.id >= ids[3]));
    }

    #[tokio::test]
    async fn test_pending_count_excludes_started() {
        let storage = InMemoryQueueStorage::new();
        enqueue(&storage, Priority::Normal).await;
        enqueue(&storage, Priority::Normal).await;
        assert_eq!(storage.pending_count(Priority::Normal).await.unwrap(), 2);
        storage.dequeue(&Priority::DEQUEUE_ORDER).await.unwrap();
        assert_eq!(storage.pending_count(Priority::Normal).await.unwrap(), 1);
        assert_eq!(storage.pending_count(Priority::Utmost).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lease_single_owner() {
        let storage = InMemoryLeaseStorage::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let ttl = Duration::from_secs(60);

        let lease = storage.maybe_acquire("scheduler", a, ttl).await.unwrap();
        assert!(lease.is_some());
        // Contender is refused while the lease is live.
        assert!(storage
            .maybe_acquire("scheduler", b, ttl)
            .await
            .unwrap()
            .is_none());
        // Renewal by the owner succeeds.
        assert!(storage
            .maybe_acquire("scheduler", a, ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lease_release_by_non_owner_is_noop() {
        let storage = InMemoryLeaseStorage::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let ttl = Duration::from_secs(60);

        storage.maybe_acquire("scheduler", a, ttl).await.unwrap();
        storage.release("scheduler", b).await.unwrap();
        // Still owned by a.
        assert!(storage
            .maybe_acquire("scheduler", b, ttl)
            .await
            .unwrap()
            .is_none());

        storage.release("scheduler", a).await.unwrap();
        assert!(storage
            .maybe_acquire("scheduler", b, ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_log_pagination() {
        let storage = InMemoryLogStorage::new();
        for i in 0..5 {
            storage
                .append(1, "info", &format!("line {i}"))
                .await
                .unwrap();
        }
        let lines = storage.read(1, None, 100).await.unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].id, 1);

        let tail = storage.read(1, Some(3), 100).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 4);

        let capped = storage.read(1, None, 2).await.unwrap();
        assert_eq!(capped.len(), 2);

        storage.delete(1).await.unwrap();
        assert!(storage.read(1, None, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scraper_crud_and_search() {
        let storage = InMemoryScraperStorage::new();
        let scraper = common::model::CreateScraperRequest {
            name: "Hacker News".into(),
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            schedule: common::model::Schedule::EveryHour,
            schedule_crontab: None,
            priority: Priority::Normal,
            timeout_seconds: None,
        }
        .into_scraper();
        let created = storage.create(scraper.clone()).await.unwrap();
        assert_eq!(storage.get(created.id).await.unwrap(), created);

        let found = storage
            .search(&SearchFilters {
                name_filter: Some("hacker".into()),
                max_items: Some(10),
                last_seen_id: None,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        storage.delete(created.id).await.unwrap();
        assert!(storage.get(created.id).await.unwrap_err().is_not_found());
        assert!(storage.maybe_get(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let storage = InMemoryScraperStorage::with_scrapers(vec![], true);
        let scraper = common::model::CreateScraperRequest {
            name: "news".into(),
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            schedule: common::model::Schedule::Inactive,
            schedule_crontab: None,
            priority: Priority::Normal,
            timeout_seconds: None,
        }
        .into_scraper();
        assert!(storage.create(scraper).await.unwrap_err().is_read_only());
    }
}
