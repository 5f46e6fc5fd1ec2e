use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use errors::{Error, Result};
use log::{debug, error, info, warn};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::interface::LogStorage;
use common::model::{Task, TaskStatus};
use common::TaskLogger;
use utils::retry::{with_retries, DEFAULT_ATTEMPTS};

use crate::queue::Queue;

/// Everything a task handler gets to work with: the immutable task record,
/// the cancellation token shared with the heartbeat, and the per-task log
/// sink. Handlers are expected to be cooperatively cancellable; their I/O
/// goes through primitives that select against the token.
pub struct TaskContext {
    pub task: Task,
    pub token: CancellationToken,
    pub logger: TaskLogger,
}

/// Processes one kind of queued task, resolved by handler name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> String;

    async fn process(&self, context: &TaskContext) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Initial sleep after an empty poll; doubles up to `max_poll_delay`.
    pub poll_delay: Duration,
    pub max_poll_delay: Duration,
    /// Heartbeat period while a task is running.
    pub ping_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            concurrency: 50,
            poll_delay: Duration::from_millis(50),
            max_poll_delay: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// Worker pool pulling tasks off the queue and driving them to a terminal
/// state. A handler fault never takes a worker loop down with it.
pub struct Consumer {
    queue: Arc<Queue>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    logs: Arc<dyn LogStorage>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn new(
        queue: Arc<Queue>,
        handlers: Vec<Arc<dyn TaskHandler>>,
        logs: Arc<dyn LogStorage>,
        config: ConsumerConfig,
    ) -> Self {
        Consumer {
            queue,
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
            logs,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelling every worker loop and the tasks they are running.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns the worker loops; the returned handles finish after shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("starting consumer with {} workers", self.config.concurrency);
        (0..self.config.concurrency)
            .map(|worker_id| {
                let consumer = self.clone();
                tokio::spawn(async move { consumer.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        let mut delay = self.config.poll_delay;
        loop {
            if self.shutdown.is_cancelled() {
                debug!("worker {worker_id} shutting down");
                return;
            }
            match self.queue.dequeue().await {
                Ok(Some(task)) => {
                    delay = self.config.poll_delay;
                    self.process(task).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.max_poll_delay);
                }
                Err(e) => {
                    warn!("worker {worker_id} failed to dequeue: {e}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.max_poll_delay);
                }
            }
        }
    }

    async fn process(&self, task: Task) {
        let task_id = task.id;
        let queued_for = (Utc::now() - task.created_at)
            .to_std()
            .unwrap_or_default();
        histogram!("task_time_in_queue_seconds").record(queued_for.as_secs_f64());
        gauge!("worker_active_tasks").increment(1.0);
        info!("executing task id={task_id} handler={}", task.handler);

        let token = self.shutdown.child_token();
        let logger = TaskLogger::new(self.logs.clone(), task_id);
        let timeout = task.timeout();
        let context = TaskContext {
            task,
            token: token.clone(),
            logger,
        };

        let heartbeat = self.spawn_heartbeat(task_id, token.clone());
        let started = tokio::time::Instant::now();

        let outcome = match self.handlers.get(&context.task.handler) {
            Some(handler) => run_handler(handler.as_ref(), &context, timeout).await,
            None => Err(Error::from(errors::QueueError::UnknownHandler(
                context.task.handler.clone(),
            ))),
        };

        // Stop the heartbeat before recording the terminal state, so it can
        // never stamp activity onto a finished task.
        token.cancel();
        let _ = heartbeat.await;

        let (status, result) = match outcome {
            Ok(result) => (TaskStatus::Succeeded, result),
            Err(e) if e.is_cancelled() => (TaskStatus::Killed, e.to_string()),
            Err(e) => (TaskStatus::Failed, e.to_string()),
        };
        self.finish(context.task, status, result).await;

        histogram!("task_duration_seconds").record(started.elapsed().as_secs_f64());
        gauge!("worker_active_tasks").decrement(1.0);
    }

    async fn finish(&self, mut task: Task, status: TaskStatus, result: String) {
        match status {
            TaskStatus::Succeeded => info!("task id={} succeeded", task.id),
            _ => warn!("task id={} finished as {}: {}", task.id, status.as_str(), result),
        }
        task.status = status;
        task.result = Some(result);
        task.finished_at = Some(Utc::now());
        match self.queue.update(task.clone()).await {
            Ok(_) => {
                counter!("tasks_total", "status" => status.as_str()).increment(1);
            }
            // The task went terminal elsewhere (killed or reaped); that
            // state wins.
            Err(e) if e.is_terminal_task() => {
                debug!("task id={} already terminal, keeping stored state", task.id);
            }
            Err(e) => error!("failed to persist terminal state of task id={}: {e}", task.id),
        }
    }

    fn spawn_heartbeat(&self, task_id: u64, token: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(interval) => {}
                }
                let ping = with_retries("consumer.ping", DEFAULT_ATTEMPTS, || {
                    queue.ping(task_id)
                })
                .await;
                match ping {
                    Ok(_) => {}
                    Err(e) if e.is_ping_finished() => {
                        info!("task id={task_id} is no longer started, cancelling handler");
                        token.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!("heartbeat for task id={task_id} failed persistently: {e}");
                        token.cancel();
                        return;
                    }
                }
            }
        })
    }
}

async fn run_handler(
    handler: &dyn TaskHandler,
    context: &TaskContext,
    timeout: Option<Duration>,
) -> Result<String> {
    let work = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.process(context)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::with_message::<errors::BoxError>(
                    errors::ErrorKind::Cancelled,
                    format!("task exceeded its timeout of {limit:?}"),
                    None,
                )),
            },
            None => handler.process(context).await,
        }
    };
    tokio::select! {
        _ = context.token.cancelled() => Err(Error::cancelled()),
        outcome = work => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{EnqueueRequest, Priority, ScraperConfig};
    use storage::{InMemoryLogStorage, InMemoryQueueStorage};

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        fn name(&self) -> String {
            "ok".into()
        }

        async fn process(&self, context: &TaskContext) -> Result<String> {
            context.logger.info("doing the work").await;
            Ok("done".into())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        fn name(&self) -> String {
            "failing".into()
        }

        async fn process(&self, _context: &TaskContext) -> Result<String> {
            Err(Error::validation("bad input"))
        }
    }

    struct StuckHandler;

    #[async_trait]
    impl TaskHandler for StuckHandler {
        fn name(&self) -> String {
            "stuck".into()
        }

        async fn process(&self, context: &TaskContext) -> Result<String> {
            context.token.cancelled().await;
            Err(Error::cancelled())
        }
    }

    fn request(handler: &str, timeout_seconds: Option<u64>) -> EnqueueRequest {
        EnqueueRequest {
            scraper_id: None,
            handler: handler.into(),
            config: ScraperConfig::default(),
            priority: Priority::Normal,
            timeout_seconds,
        }
    }

    fn consumer(queue: Arc<Queue>, logs: Arc<InMemoryLogStorage>) -> Arc<Consumer> {
        Arc::new(Consumer::new(
            queue,
            vec![
                Arc::new(OkHandler) as Arc<dyn TaskHandler>,
                Arc::new(FailingHandler),
                Arc::new(StuckHandler),
            ],
            logs,
            ConsumerConfig {
                concurrency: 2,
                poll_delay: Duration::from_millis(5),
                max_poll_delay: Duration::from_millis(20),
                ping_interval: Duration::from_millis(20),
            },
        ))
    }

    async fn wait_terminal(queue: &Queue, task_id: u64) -> Task {
        for _ in 0..200 {
            let task = queue.get_task(task_id).await.unwrap();
            if task.is_terminal() {
                return task;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_successful_run_records_result_and_logs() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let consumer = consumer(queue.clone(), logs.clone());
        let handles = consumer.start();

        let task = queue.enqueue(request("ok", None)).await.unwrap();
        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.as_deref(), Some("done"));
        assert!(done.finished_at.is_some());

        let lines = logs.read(task.id, None, 10).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "doing the work");

        consumer.shutdown_token().cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_handler_failure_is_captured() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let consumer = consumer(queue.clone(), logs);
        consumer.start();

        let task = queue.enqueue(request("failing", None)).await.unwrap();
        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.result.as_deref().unwrap().contains("bad input"));

        consumer.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_task_not_worker() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let consumer = consumer(queue.clone(), logs);
        consumer.start();

        let task = queue.enqueue(request("nonexistent", None)).await.unwrap();
        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.result.as_deref().unwrap().contains("nonexistent"));

        // The pool is still alive and serving.
        let task = queue.enqueue(request("ok", None)).await.unwrap();
        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Succeeded);

        consumer.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_kill_cancels_running_handler() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let consumer = consumer(queue.clone(), logs);
        consumer.start();

        let task = queue.enqueue(request("stuck", None)).await.unwrap();
        // Let a worker pick it up, then kill it.
        for _ in 0..200 {
            let current = queue.get_task(task.id).await.unwrap();
            if current.status == TaskStatus::Started {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        queue.kill(task.id).await.unwrap();

        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Killed);

        consumer.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_task_timeout_kills_handler() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let logs = Arc::new(InMemoryLogStorage::new());
        let consumer = consumer(queue.clone(), logs);
        consumer.start();

        // A handler that never yields to cancellation on its own still
        // terminates through the task-wide timeout.
        let task = queue.enqueue(request("stuck", Some(1))).await.unwrap();
        let done = wait_terminal(&queue, task.id).await;
        assert_eq!(done.status, TaskStatus::Killed);
        assert!(done.result.as_deref().unwrap().contains("cancelled"));

        consumer.shutdown_token().cancel();
    }
}
