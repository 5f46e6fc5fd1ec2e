//! Redis-backed storage shared across nodes.
//!
//! Key layout:
//! - `scrapers:{id}` JSON blob per scraper, `scraper_ids` set of ids
//! - `tasks:{id}` hash: `body` (JSON), `status`, `started_at`, `last_active_at`
//! - `tasks:next_id` counter
//! - `queue:{priority}` list of pending task ids (LPUSH/RPOP FIFO)
//! - `tasks:by_scraper:{key}` sorted set scored by created_at millis
//! - `leases:{name}` owner id with PX expiry
//! - `logs:{task_id}` list of log line JSON, `logs:{task_id}:next_id` counter
//!
//! Multi-key invariants (atomic dequeue, lease CAS, log append) run as Lua
//! scripts; everything else uses atomic pipelines.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::{Connection, Pool};
use errors::{Error, QueueError, Result};
use uuid::Uuid;

use common::interface::{LeaseStorage, LogStorage, QueueStorage, ScraperStorage};
use common::model::{Lease, LogLine, Priority, Scraper, SearchFilters, Task, TaskStatus};

const DEQUEUE_SCRIPT: &str = r#"
for i, qkey in ipairs(KEYS) do
    while true do
        local id = redis.call('RPOP', qkey)
        if not id then
            break
        end
        local tkey = 'tasks:' .. id
        local status = redis.call('HGET', tkey, 'status')
        if status == 'pending' then
            redis.call('HSET', tkey, 'status', 'started', 'started_at', ARGV[1], 'last_active_at', ARGV[1])
            return id
        end
    end
end
return false
"#;

const UPDATE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if current == false then
    return -1
end
local terminal = {succeeded = true, failed = true, dead = true, killed = true}
if terminal[current] and current ~= ARGV[2] then
    return -2
end
redis.call('HSET', KEYS[1], 'body', ARGV[1], 'status', ARGV[2])
if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[1], 'started_at', ARGV[3])
end
if ARGV[4] ~= '' then
    redis.call('HSET', KEYS[1], 'last_active_at', ARGV[4])
end
return 1
"#;

const LEASE_ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

const LEASE_RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const LOG_APPEND_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[2])
local line = cjson.decode(ARGV[1])
line['id'] = id
local encoded = cjson.encode(line)
redis.call('RPUSH', KEYS[1], encoded)
return encoded
"#;

const DELETE_SCRAPER_SCRIPT: &str = r#"
local body = redis.call('GET', KEYS[1])
if body == false then
    return false
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return body
"#;

fn scraper_key(id: Uuid) -> String {
    format!("scrapers:{id}")
}

fn task_key(id: u64) -> String {
    format!("tasks:{id}")
}

fn queue_key(priority: Priority) -> String {
    format!("queue:{}", priority.suffix())
}

fn by_scraper_key(scraper_key: &str) -> String {
    format!("tasks:by_scraper:{scraper_key}")
}

fn lease_key(name: &str) -> String {
    format!("leases:{name}")
}

fn logs_key(task_id: u64) -> String {
    format!("logs:{task_id}")
}

fn logs_next_id_key(task_id: u64) -> String {
    format!("logs:{task_id}:next_id")
}

fn status_from_str(status: &str) -> Option<TaskStatus> {
    match status {
        "pending" => Some(TaskStatus::Pending),
        "started" => Some(TaskStatus::Started),
        "succeeded" => Some(TaskStatus::Succeeded),
        "failed" => Some(TaskStatus::Failed),
        "dead" => Some(TaskStatus::Dead),
        "killed" => Some(TaskStatus::Killed),
        _ => None,
    }
}

async fn connection(pool: &Pool) -> Result<Connection> {
    pool.get().await.map_err(Error::storage_unavailable)
}

pub struct RedisScraperStorage {
    pool: Pool,
    read_only: bool,
}

impl RedisScraperStorage {
    pub fn new(pool: Pool, read_only: bool) -> Self {
        RedisScraperStorage { pool, read_only }
    }
}

#[async_trait]
impl ScraperStorage for RedisScraperStorage {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn list(&self) -> Result<Vec<Scraper>> {
        let mut conn = connection(&self.pool).await?;
        let ids: Vec<String> = cmd("SMEMBERS")
            .arg("scraper_ids")
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| id.parse::<Uuid>().ok())
            .map(scraper_key)
            .collect();
        let bodies: Vec<Option<String>> = cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        let mut scrapers: Vec<Scraper> = bodies
            .into_iter()
            .flatten()
            .filter_map(|body| serde_json::from_str(&body).ok())
            .collect();
        scrapers.sort_by_key(|s: &Scraper| s.id);
        Ok(scrapers)
    }

    async fn get(&self, id: Uuid) -> Result<Scraper> {
        self.maybe_get(id).await?.ok_or_else(Error::not_found)
    }

    async fn maybe_get(&self, id: Uuid) -> Result<Option<Scraper>> {
        let mut conn = connection(&self.pool).await?;
        let body: Option<String> = cmd("GET")
            .arg(scraper_key(id))
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
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
        let mut conn = connection(&self.pool).await?;
        let body = serde_json::to_string(&scraper)?;
        deadpool_redis::redis::pipe()
            .atomic()
            .set(scraper_key(scraper.id), &body)
            .ignore()
            .sadd("scraper_ids", scraper.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(scraper)
    }

    async fn update(&self, scraper: Scraper) -> Result<Scraper> {
        if self.read_only {
            return Err(Error::read_only());
        }
        let mut conn = connection(&self.pool).await?;
        let body = serde_json::to_string(&scraper)?;
        let outcome: Option<String> = cmd("SET")
            .arg(scraper_key(scraper.id))
            .arg(&body)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        if outcome.is_none() {
            return Err(Error::not_found());
        }
        Ok(scraper)
    }

    async fn delete(&self, id: Uuid) -> Result<Scraper> {
        if self.read_only {
            return Err(Error::read_only());
        }
        let mut conn = connection(&self.pool).await?;
        let body: Option<String> = Script::new(DELETE_SCRAPER_SCRIPT)
            .key(scraper_key(id))
            .key("scraper_ids")
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(Error::not_found()),
        }
    }
}

pub struct RedisQueueStorage {
    pool: Pool,
}

impl RedisQueueStorage {
    pub fn new(pool: Pool) -> Self {
        RedisQueueStorage { pool }
    }

    fn compose_task(fields: std::collections::HashMap<String, String>) -> Result<Task> {
        let mut body: Option<String> = None;
        let mut status: Option<TaskStatus> = None;
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut last_active_at: Option<DateTime<Utc>> = None;
        for (field, value) in fields {
            match field.as_str() {
                "body" => body = Some(value),
                "status" => status = status_from_str(&value),
                "started_at" => {
                    started_at = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                }
                "last_active_at" => {
                    last_active_at = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                }
                _ => {}
            }
        }
        let body = body.ok_or(Error::from(QueueError::TaskNotFound))?;
        let mut task: Task = serde_json::from_str(&body)?;
        // The hash fields win over the blob: the dequeue script updates them
        // without rewriting the body.
        if let Some(status) = status {
            task.status = status;
        }
        if started_at.is_some() {
            task.started_at = started_at;
        }
        if last_active_at.is_some() {
            task.last_active_at = last_active_at;
        }
        Ok(task)
    }

    async fn fetch(&self, conn: &mut Connection, task_id: u64) -> Result<Task> {
        let fields: std::collections::HashMap<String, String> = cmd("HGETALL")
            .arg(task_key(task_id))
            .query_async(conn)
            .await
            .map_err(Error::storage_unavailable)?;
        if fields.is_empty() {
            return Err(QueueError::TaskNotFound.into());
        }
        Self::compose_task(fields)
    }

    async fn scan_keys(&self, conn: &mut Connection, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await
                .map_err(Error::storage_unavailable)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl QueueStorage for RedisQueueStorage {
    async fn next_task_id(&self) -> Result<u64> {
        let mut conn = connection(&self.pool).await?;
        cmd("INCR")
            .arg("tasks:next_id")
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)
    }

    async fn enqueue(&self, task: Task) -> Result<Task> {
        let mut conn = connection(&self.pool).await?;
        let body = serde_json::to_string(&task)?;
        deadpool_redis::redis::pipe()
            .atomic()
            .hset(task_key(task.id), "body", &body)
            .ignore()
            .hset(task_key(task.id), "status", task.status.as_str())
            .ignore()
            .lpush(queue_key(task.priority), task.id.to_string())
            .ignore()
            .zadd(
                by_scraper_key(&task.scraper_key()),
                task.id.to_string(),
                task.created_at.timestamp_millis(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(task)
    }

    async fn dequeue(&self, priorities: &[Priority]) -> Result<Option<Task>> {
        let mut conn = connection(&self.pool).await?;
        let script = Script::new(DEQUEUE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for priority in priorities {
            invocation.key(queue_key(*priority));
        }
        invocation.arg(Utc::now().to_rfc3339());
        let id: Option<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        let id = match id.and_then(|id| id.parse::<u64>().ok()) {
            Some(id) => id,
            None => return Ok(None),
        };
        let task = self.fetch(&mut conn, id).await?;
        // Bring the blob back in sync with the claim the script recorded.
        let body = serde_json::to_string(&task)?;
        let _ = cmd("HSET")
            .arg(task_key(id))
            .arg("body")
            .arg(&body)
            .query_async::<()>(&mut conn)
            .await;
        Ok(Some(task))
    }

    async fn update(&self, task: Task) -> Result<Task> {
        let mut conn = connection(&self.pool).await?;
        let body = serde_json::to_string(&task)?;
        let started = task
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let last_active = task
            .last_active_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let outcome: i64 = Script::new(UPDATE_SCRIPT)
            .key(task_key(task.id))
            .arg(&body)
            .arg(task.status.as_str())
            .arg(started)
            .arg(last_active)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        match outcome {
            1 => Ok(task),
            -2 => Err(QueueError::TerminalTask.into()),
            _ => Err(QueueError::TaskNotFound.into()),
        }
    }

    async fn get(&self, task_id: u64) -> Result<Task> {
        let mut conn = connection(&self.pool).await?;
        self.fetch(&mut conn, task_id).await
    }

    async fn list_by_scraper(&self, scraper_key: &str) -> Result<Vec<Task>> {
        let mut conn = connection(&self.pool).await?;
        let ids: Vec<String> = cmd("ZREVRANGE")
            .arg(by_scraper_key(scraper_key))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids.iter().filter_map(|id| id.parse::<u64>().ok()) {
            match self.fetch(&mut conn, id).await {
                Ok(task) => tasks.push(task),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    async fn list_active(&self) -> Result<Vec<Task>> {
        let mut conn = connection(&self.pool).await?;
        let keys = self.scan_keys(&mut conn, "tasks:*").await?;
        let mut tasks = Vec::new();
        for key in keys {
            let id = match key.strip_prefix("tasks:").and_then(|s| s.parse::<u64>().ok()) {
                Some(id) => id,
                // Skips tasks:next_id and tasks:by_scraper:* entries.
                None => continue,
            };
            let status: Option<String> = cmd("HGET")
                .arg(&key)
                .arg("status")
                .query_async(&mut conn)
                .await
                .map_err(Error::storage_unavailable)?;
            let is_active = status
                .as_deref()
                .and_then(status_from_str)
                .map(|s| matches!(s, TaskStatus::Pending | TaskStatus::Started))
                .unwrap_or(false);
            if is_active {
                match self.fetch(&mut conn, id).await {
                    Ok(task) => tasks.push(task),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn delete_old(&self, retention: usize) -> Result<Vec<u64>> {
        let mut conn = connection(&self.pool).await?;
        let index_keys = self.scan_keys(&mut conn, "tasks:by_scraper:*").await?;
        let mut deleted = Vec::new();
        for index_key in index_keys {
            let ids: Vec<String> = cmd("ZREVRANGE")
                .arg(&index_key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(Error::storage_unavailable)?;
            let mut terminal_seen = 0usize;
            for id in ids.iter().filter_map(|id| id.parse::<u64>().ok()) {
                let status: Option<String> = cmd("HGET")
                    .arg(task_key(id))
                    .arg("status")
                    .query_async(&mut conn)
                    .await
                    .map_err(Error::storage_unavailable)?;
                let status = status.as_deref().and_then(status_from_str);
                let is_terminal = status.map(|s| s.is_terminal()).unwrap_or(false);
                if !is_terminal {
                    continue;
                }
                terminal_seen += 1;
                if terminal_seen <= retention {
                    continue;
                }
                deadpool_redis::redis::pipe()
                    .atomic()
                    .del(task_key(id))
                    .ignore()
                    .zrem(&index_key, id.to_string())
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(Error::storage_unavailable)?;
                deleted.push(id);
            }
        }
        Ok(deleted)
    }

    async fn pending_count(&self, priority: Priority) -> Result<u64> {
        let mut conn = connection(&self.pool).await?;
        cmd("LLEN")
            .arg(queue_key(priority))
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)
    }
}

pub struct RedisLeaseStorage {
    pool: Pool,
}

impl RedisLeaseStorage {
    pub fn new(pool: Pool) -> Self {
        RedisLeaseStorage { pool }
    }
}

#[async_trait]
impl LeaseStorage for RedisLeaseStorage {
    async fn maybe_acquire(
        &self,
        name: &str,
        owner: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut conn = connection(&self.pool).await?;
        let acquired: i64 = Script::new(LEASE_ACQUIRE_SCRIPT)
            .key(lease_key(name))
            .arg(owner.to_string())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        if acquired != 1 {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(Some(Lease {
            name: name.to_string(),
            owner,
            acquired_at: now,
            acquired_until: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
        }))
    }

    async fn release(&self, name: &str, owner: Uuid) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = Script::new(LEASE_RELEASE_SCRIPT)
            .key(lease_key(name))
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(())
    }
}

pub struct RedisLogStorage {
    pool: Pool,
}

impl RedisLogStorage {
    pub fn new(pool: Pool) -> Self {
        RedisLogStorage { pool }
    }
}

#[async_trait]
impl LogStorage for RedisLogStorage {
    async fn append(&self, task_id: u64, level: &str, message: &str) -> Result<LogLine> {
        let mut conn = connection(&self.pool).await?;
        let line = LogLine {
            id: 0,
            task_id,
            level: level.to_string(),
            timestamp: Utc::now(),
            message: message.to_string(),
        };
        let encoded: String = Script::new(LOG_APPEND_SCRIPT)
            .key(logs_key(task_id))
            .key(logs_next_id_key(task_id))
            .arg(serde_json::to_string(&line)?)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(serde_json::from_str(&encoded)?)
    }

    async fn read(
        &self,
        task_id: u64,
        after_id: Option<u64>,
        max_lines: usize,
    ) -> Result<Vec<LogLine>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }
        let mut conn = connection(&self.pool).await?;
        // Line ids are dense and 1-based, so the line with id k sits at
        // list index k-1.
        let start = after_id.unwrap_or(0) as i64;
        let stop = start + max_lines as i64 - 1;
        let bodies: Vec<String> = cmd("LRANGE")
            .arg(logs_key(task_id))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(bodies
            .into_iter()
            .filter_map(|body| serde_json::from_str(&body).ok())
            .collect())
    }

    async fn delete(&self, task_id: u64) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        cmd("DEL")
            .arg(logs_key(task_id))
            .arg(logs_next_id_key(task_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(Error::storage_unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            scraper_key(id),
            "scrapers:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(task_key(42), "tasks:42");
        assert_eq!(queue_key(Priority::Utmost), "queue:utmost");
        assert_eq!(by_scraper_key("ephemeral"), "tasks:by_scraper:ephemeral");
        assert_eq!(lease_key("scheduler"), "leases:scheduler");
        assert_eq!(logs_key(7), "logs:7");
        assert_eq!(logs_next_id_key(7), "logs:7:next_id");
    }

    #[test]
    fn test_status_names_match_serde() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Started,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Dead,
            TaskStatus::Killed,
        ] {
            assert_eq!(status_from_str(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(status_from_str("unknown"), None);
    }

    #[test]
    fn test_compose_task_overrides_blob_with_hash_fields() {
        let task = common::model::EnqueueRequest {
            scraper_id: None,
            handler: "news_handler".into(),
            config: Default::default(),
            priority: Priority::Normal,
            timeout_seconds: None,
        }
        .into_task(3, Utc::now());
        let body = serde_json::to_string(&task).unwrap();
        let stamp = Utc::now();
        let fields: std::collections::HashMap<String, String> = [
            ("body".to_string(), body),
            ("status".to_string(), "started".to_string()),
            ("started_at".to_string(), stamp.to_rfc3339()),
            ("last_active_at".to_string(), stamp.to_rfc3339()),
        ]
        .into_iter()
        .collect();
        let composed = RedisQueueStorage::compose_task(fields).unwrap();
        assert_eq!(composed.status, TaskStatus::Started);
        assert!(composed.started_at.is_some());
        assert_eq!(composed.started_at, composed.last_active_at);
    }

    #[test]
    fn test_scripts_touch_expected_commands() {
        assert!(DEQUEUE_SCRIPT.contains("RPOP"));
        assert!(DEQUEUE_SCRIPT.contains("'status', 'started'"));
        assert!(LEASE_ACQUIRE_SCRIPT.contains("'PX'"));
        assert!(LEASE_RELEASE_SCRIPT.contains("DEL"));
        assert!(LOG_APPEND_SCRIPT.contains("INCR"));
    }
}
