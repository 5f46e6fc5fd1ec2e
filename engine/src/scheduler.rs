use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use errors::Result;
use log::{debug, error, info};
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::interface::{LogStorage, ScraperStorage};
use common::model::{EnqueueRequest, Priority, Scraper};
use queue::Queue;

use crate::config::SchedulerConfig;
use crate::trigger::TriggerState;

/// Leader-elected scheduler: trigger evaluation, dead-task reaping, history
/// GC and queue metric export. The four jobs run serially inside one loop
/// and only while this replica holds the scheduler lease.
pub struct Scheduler {
    scrapers: Arc<dyn ScraperStorage>,
    queue: Arc<Queue>,
    logs: Arc<dyn LogStorage>,
    leader: watch::Receiver<bool>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        scrapers: Arc<dyn ScraperStorage>,
        queue: Arc<Queue>,
        logs: Arc<dyn LogStorage>,
        leader: watch::Receiver<bool>,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            scrapers,
            queue,
            logs,
            leader,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("scheduler loop starting");
        let mut triggers = TriggerState::new();
        let mut known: HashMap<Uuid, Scraper> = HashMap::new();

        let now = Utc::now();
        let mut next_triggers = now;
        let mut next_reap = now;
        let mut next_gc = now + chrono::Duration::from_std(self.config.gc_interval).unwrap_or_default();
        let mut next_metrics = now;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler loop stopping");
                    return;
                }
                _ = sleep(self.config.tick) => {}
            }
            if !*self.leader.borrow() {
                // Standby replicas keep their trigger state cold so a
                // fail-over coalesces missed fires instead of replaying them.
                continue;
            }

            let now = Utc::now();
            if now >= next_triggers {
                if let Err(e) = self.evaluate_triggers(&mut triggers, &mut known, now).await {
                    error!("trigger evaluation failed: {e}");
                }
                next_triggers = now
                    + chrono::Duration::from_std(self.config.poll_delay).unwrap_or_default();
            }
            if now >= next_reap {
                if let Err(e) = self.reap_dead_tasks().await {
                    error!("dead task reaping failed: {e}");
                }
                next_reap = now
                    + chrono::Duration::from_std(self.config.reaper_interval).unwrap_or_default();
            }
            if now >= next_gc {
                if let Err(e) = self.collect_history().await {
                    error!("history gc failed: {e}");
                }
                next_gc =
                    now + chrono::Duration::from_std(self.config.gc_interval).unwrap_or_default();
            }
            if now >= next_metrics {
                if let Err(e) = self.export_metrics().await {
                    debug!("metric export failed: {e}");
                }
                next_metrics = now
                    + chrono::Duration::from_std(self.config.metrics_interval).unwrap_or_default();
            }
        }
    }

    async fn evaluate_triggers(
        &self,
        triggers: &mut TriggerState,
        known: &mut HashMap<Uuid, Scraper>,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let scrapers = self.scrapers.list().await?;
        triggers.sync(&scrapers, now);
        known.clear();
        known.extend(scrapers.into_iter().map(|s| (s.id, s)));

        for id in triggers.due(now) {
            let scraper = match known.get(&id) {
                Some(scraper) => scraper,
                None => continue,
            };
            self.fire(scraper).await;
        }
        Ok(())
    }

    async fn fire(&self, scraper: &Scraper) {
        // Backpressure: leave the fire on the floor when this priority
        // class is already backed up.
        match self.queue.pending_count(scraper.priority).await {
            Ok(pending) if pending >= self.config.backpressure_high_water => {
                counter!("scheduler_skipped_total", "reason" => "backpressure").increment(1);
                info!(
                    "skipping scraper {} ({}): {pending} tasks pending at priority {}",
                    scraper.name, scraper.id, scraper.priority
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("failed to read pending count: {e}");
                return;
            }
        }

        let request = EnqueueRequest {
            scraper_id: Some(scraper.id),
            handler: scraper.handler.clone(),
            config: scraper.config.clone(),
            priority: scraper.priority,
            timeout_seconds: scraper.timeout_seconds,
        };
        match self.queue.enqueue(request).await {
            Ok(task) => {
                debug!(
                    "enqueued task id={} for scraper {} ({})",
                    task.id, scraper.name, scraper.id
                );
            }
            Err(e) if e.is_task_active() => {
                counter!("scheduler_skipped_total", "reason" => "active_run").increment(1);
                debug!(
                    "skipping scraper {} ({}): a task is already pending or started",
                    scraper.name, scraper.id
                );
            }
            Err(e) => {
                error!("failed to enqueue scraper {} ({}): {e}", scraper.name, scraper.id);
            }
        }
    }

    async fn reap_dead_tasks(&self) -> Result<()> {
        let dead = self.queue.mark_dead(self.config.dead_threshold).await?;
        if !dead.is_empty() {
            info!("reaper wrote off {} dead task(s)", dead.len());
        }
        Ok(())
    }

    async fn collect_history(&self) -> Result<()> {
        let deleted = self.queue.delete_old(self.config.retention).await?;
        for task_id in &deleted {
            self.logs.delete(*task_id).await?;
        }
        if !deleted.is_empty() {
            info!("history gc removed {} task(s)", deleted.len());
        }
        Ok(())
    }

    async fn export_metrics(&self) -> Result<()> {
        for priority in Priority::all() {
            let pending = self.queue.pending_count(*priority).await?;
            gauge!("pending_tasks", "priority" => priority.suffix()).set(pending as f64);
        }
        gauge!("active_tasks").set(self.queue.active_count().await? as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{Schedule, ScraperConfig, TaskStatus};
    use std::time::Duration;
    use storage::{InMemoryLogStorage, InMemoryQueueStorage, InMemoryScraperStorage};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(10),
            poll_delay: Duration::from_millis(20),
            reaper_interval: Duration::from_millis(50),
            gc_interval: Duration::from_millis(100),
            metrics_interval: Duration::from_millis(50),
            dead_threshold: Duration::from_secs(25),
            retention: 2,
            backpressure_high_water: 1000,
            lease_ttl: Duration::from_secs(60),
        }
    }

    struct Fixture {
        scrapers: Arc<InMemoryScraperStorage>,
        queue: Arc<Queue>,
        logs: Arc<InMemoryLogStorage>,
        leader_tx: watch::Sender<bool>,
        shutdown: CancellationToken,
    }

    fn fixture(leader: bool) -> (Fixture, Scheduler) {
        let scrapers = Arc::new(InMemoryScraperStorage::new());
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let (leader_tx, leader_rx) = watch::channel(leader);
        let scheduler = Scheduler::new(
            scrapers.clone(),
            queue.clone(),
            logs.clone(),
            leader_rx,
            test_config(),
        );
        (
            Fixture {
                scrapers,
                queue,
                logs,
                leader_tx,
                shutdown: CancellationToken::new(),
            },
            scheduler,
        )
    }

    fn every_second_scraper() -> Scraper {
        Scraper {
            id: Uuid::now_v7(),
            name: "news".into(),
            handler: "news_handler".into(),
            config: ScraperConfig::default(),
            schedule: Schedule::EverySecond,
            schedule_crontab: None,
            priority: Priority::Normal,
            state: None,
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_active_scheduler_enqueues_and_skips_concurrent_runs() {
        let (fixture, scheduler) = fixture(true);
        let scraper = every_second_scraper();
        fixture.scrapers.create(scraper.clone()).await.unwrap();

        let shutdown = fixture.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });

        // Wait for the first fire.
        let mut fired = None;
        for _ in 0..300 {
            let tasks = fixture.queue.list_by_scraper(&scraper.id.to_string()).await.unwrap();
            if let Some(task) = tasks.first() {
                fired = Some(task.clone());
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let fired = fired.expect("scheduler never enqueued");
        assert_eq!(fired.status, TaskStatus::Pending);

        // While the task stays active, further fires are skipped.
        sleep(Duration::from_millis(1200)).await;
        let tasks = fixture.queue.list_by_scraper(&scraper.id.to_string()).await.unwrap();
        assert_eq!(tasks.len(), 1);

        // Finish the run; the next fire enqueues again.
        let mut task = fixture.queue.dequeue().await.unwrap().unwrap();
        task.status = TaskStatus::Succeeded;
        task.finished_at = Some(Utc::now());
        fixture.queue.update(task).await.unwrap();

        let mut second = None;
        for _ in 0..300 {
            let tasks = fixture.queue.list_by_scraper(&scraper.id.to_string()).await.unwrap();
            if tasks.iter().any(|t| t.is_active()) {
                second = Some(());
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(second.is_some(), "no task enqueued after the first finished");

        fixture.shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_standby_scheduler_enqueues_nothing() {
        let (fixture, scheduler) = fixture(false);
        let scraper = every_second_scraper();
        fixture.scrapers.create(scraper.clone()).await.unwrap();

        let shutdown = fixture.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });

        sleep(Duration::from_millis(1200)).await;
        let tasks = fixture.queue.list_by_scraper(&scraper.id.to_string()).await.unwrap();
        assert!(tasks.is_empty());

        // Promotion to leader starts enqueueing.
        fixture.leader_tx.send(true).unwrap();
        let mut fired = false;
        for _ in 0..300 {
            let tasks = fixture.queue.list_by_scraper(&scraper.id.to_string()).await.unwrap();
            if !tasks.is_empty() {
                fired = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(fired);

        fixture.shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_trims_history_and_logs() {
        let (fixture, scheduler) = fixture(true);

        // Build up terminal history for one scraper key by hand.
        let scraper_id = Uuid::now_v7();
        for _ in 0..4 {
            let task = fixture
                .queue
                .enqueue(EnqueueRequest {
                    scraper_id: Some(scraper_id),
                    handler: "news_handler".into(),
                    config: ScraperConfig::default(),
                    priority: Priority::Normal,
                    timeout_seconds: None,
                })
                .await
                .unwrap();
            fixture.logs.append(task.id, "info", "line").await.unwrap();
            let mut task = fixture.queue.dequeue().await.unwrap().unwrap();
            task.status = TaskStatus::Succeeded;
            task.finished_at = Some(Utc::now());
            fixture.queue.update(task).await.unwrap();
        }

        let shutdown = fixture.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });

        let mut trimmed = false;
        for _ in 0..300 {
            let tasks = fixture
                .queue
                .list_by_scraper(&scraper_id.to_string())
                .await
                .unwrap();
            if tasks.len() == 2 {
                trimmed = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(trimmed, "history never trimmed to retention");

        fixture.shutdown.cancel();
        handle.await.unwrap();
    }
}
