use std::sync::Arc;

use errors::{Error, ErrorKind, Result};
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::interface::{LeaseStorage, LogStorage, Middleware, QueueStorage, ScraperStorage};
use context::{
    MiddlewareChain, ParserMiddleware, ProxyMiddleware, RateLimiterMiddleware,
    RequestLoggingMiddleware, RobotsTxtMiddleware, ScraperHandler, UserAgentInjectorMiddleware,
};
use queue::{Consumer, ConsumerConfig, Queue};
use storage::{
    InMemoryLeaseStorage, InMemoryLogStorage, InMemoryQueueStorage, InMemoryScraperStorage,
    RedisLeaseStorage, RedisLogStorage, RedisQueueStorage, RedisScraperStorage,
};

use crate::api::{self, ApiState};
use crate::config::{ServerConfig, StorageConfig};
use crate::handlers::ScraperTaskAdapter;
use crate::lease::{LeaseMonitor, SCHEDULER_LEASE_NAME};
use crate::registry::HandlerRegistry;
use crate::runner::ScraperRunner;
use crate::scheduler::Scheduler;

/// The full reference middleware set, in its canonical order.
pub fn default_middlewares() -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(RateLimiterMiddleware::new()),
        Arc::new(RobotsTxtMiddleware::new()),
        Arc::new(UserAgentInjectorMiddleware::new()),
        Arc::new(ProxyMiddleware::new()),
        Arc::new(RequestLoggingMiddleware::new()),
        Arc::new(ParserMiddleware::new()),
    ]
}

pub struct ServerBuilder {
    config: ServerConfig,
    handlers: Vec<Arc<dyn ScraperHandler>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    scrapers: Option<Arc<dyn ScraperStorage>>,
    queue_storage: Option<Arc<dyn QueueStorage>>,
    leases: Option<Arc<dyn LeaseStorage>>,
    logs: Option<Arc<dyn LogStorage>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        ServerBuilder {
            config,
            handlers: Vec::new(),
            middlewares: Vec::new(),
            scrapers: None,
            queue_storage: None,
            leases: None,
            logs: None,
        }
    }

    pub fn handler(mut self, handler: Arc<dyn ScraperHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handlers(mut self, handlers: Vec<Arc<dyn ScraperHandler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn default_middlewares(mut self) -> Self {
        self.middlewares.extend(default_middlewares());
        self
    }

    /// Overrides the storage backends resolved from the config; useful for
    /// embedding and tests.
    pub fn storages(
        mut self,
        scrapers: Arc<dyn ScraperStorage>,
        queue_storage: Arc<dyn QueueStorage>,
        leases: Arc<dyn LeaseStorage>,
        logs: Arc<dyn LogStorage>,
    ) -> Self {
        self.scrapers = Some(scrapers);
        self.queue_storage = Some(queue_storage);
        self.leases = Some(leases);
        self.logs = Some(logs);
        self
    }

    fn resolve_storages(
        &mut self,
    ) -> Result<(
        Arc<dyn ScraperStorage>,
        Arc<dyn QueueStorage>,
        Arc<dyn LeaseStorage>,
        Arc<dyn LogStorage>,
    )> {
        if let (Some(scrapers), Some(queue), Some(leases), Some(logs)) = (
            self.scrapers.take(),
            self.queue_storage.take(),
            self.leases.take(),
            self.logs.take(),
        ) {
            return Ok((scrapers, queue, leases, logs));
        }
        match &self.config.storage {
            StorageConfig::InMemory => Ok((
                Arc::new(InMemoryScraperStorage::with_scrapers(
                    vec![],
                    self.config.read_only,
                )),
                Arc::new(InMemoryQueueStorage::new()),
                Arc::new(InMemoryLeaseStorage::new()),
                Arc::new(InMemoryLogStorage::new()),
            )),
            StorageConfig::Redis(redis) => {
                let pool = utils::create_redis_pool(
                    &redis.redis_host,
                    redis.redis_port,
                    redis.redis_db,
                    &redis.redis_username,
                    &redis.redis_password,
                    redis.pool_size,
                )
                .ok_or_else(|| Error::storage_unavailable("failed to create redis pool"))?;
                Ok((
                    Arc::new(RedisScraperStorage::new(pool.clone(), self.config.read_only)),
                    Arc::new(RedisQueueStorage::new(pool.clone())),
                    Arc::new(RedisLeaseStorage::new(pool.clone())),
                    Arc::new(RedisLogStorage::new(pool)),
                ))
            }
        }
    }

    pub fn build(mut self) -> Result<Server> {
        utils::logger::init_logging("info");

        let (scrapers, queue_storage, leases, logs) = self.resolve_storages()?;
        let queue = Arc::new(Queue::new(queue_storage));

        #[allow(unused_mut)]
        let mut handlers = self.handlers;
        #[cfg(feature = "js-sandbox")]
        {
            if !handlers
                .iter()
                .any(|h| h.name() == crate::dynamic::DYNAMIC_SCRAPER_HANDLER_NAME)
            {
                handlers.push(Arc::new(crate::dynamic::DynamicScraperHandler::new()));
            }
        }
        let registry = Arc::new(HandlerRegistry::new(handlers));

        let chain = Arc::new(MiddlewareChain::new(self.middlewares));
        let runner = Arc::new(ScraperRunner::new(
            scrapers.clone(),
            chain.clone(),
            self.config.request_timeout(),
        ));
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            ScraperTaskAdapter::for_registry(&registry, runner),
            logs.clone(),
            ConsumerConfig {
                concurrency: self.config.workers,
                ..ConsumerConfig::default()
            },
        ));

        Ok(Server {
            config: self.config,
            scrapers,
            queue,
            logs,
            leases,
            registry,
            consumer,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Owns every long-lived component and wires them together: scheduler
/// (behind the lease), worker pool, JSON-RPC API and the metrics exporter.
pub struct Server {
    config: ServerConfig,
    scrapers: Arc<dyn ScraperStorage>,
    queue: Arc<Queue>,
    logs: Arc<dyn LogStorage>,
    leases: Arc<dyn LeaseStorage>,
    registry: Arc<HandlerRegistry>,
    consumer: Arc<Consumer>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn queue(&self) -> Arc<Queue> {
        self.queue.clone()
    }

    pub fn scrapers(&self) -> Arc<dyn ScraperStorage> {
        self.scrapers.clone()
    }

    pub fn logs(&self) -> Arc<dyn LogStorage> {
        self.logs.clone()
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Runs until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        info!("starting magpie server");
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if self.config.run_scheduler {
            let scheduler_config = self.config.scheduler_config();
            let (monitor, leader_rx) = LeaseMonitor::new(
                self.leases.clone(),
                SCHEDULER_LEASE_NAME,
                scheduler_config.lease_ttl,
            );
            handles.push(tokio::spawn(monitor.run(self.shutdown.clone())));

            let scheduler = Scheduler::new(
                self.scrapers.clone(),
                self.queue.clone(),
                self.logs.clone(),
                leader_rx,
                scheduler_config,
            );
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
        }

        if self.config.run_worker {
            // The consumer shares the server-wide shutdown token through
            // its own; link them so one cancel stops everything.
            let consumer_token = self.consumer.shutdown_token();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                shutdown.cancelled().await;
                consumer_token.cancel();
            }));
            handles.extend(self.consumer.start());
        }

        if self.config.expose_metrics {
            let exporter = PrometheusBuilder::new()
                .with_http_listener(([0, 0, 0, 0], self.config.metrics_port))
                .install();
            if let Err(e) = exporter {
                warn!("failed to install prometheus exporter: {e}");
            }
        }

        if self.config.run_api {
            let state = ApiState {
                scrapers: self.scrapers.clone(),
                queue: self.queue.clone(),
                logs: self.logs.clone(),
                handler_names: self.registry.names(),
            };
            let router = api::router(state);
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.api_port))
                .await
                .map_err(|e| {
                    Error::with_message(
                        ErrorKind::Api,
                        format!("failed to bind api port {}", self.config.api_port),
                        Some(e),
                    )
                })?;
            info!("json-rpc api listening on port {}", self.config.api_port);
            let shutdown = self.shutdown.clone();
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| Error::new(ErrorKind::Api, Some(e)))?;
        } else {
            self.shutdown.cancelled().await;
        }

        info!("magpie server shutting down");
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::model::{EnqueueRequest, Priority, ScraperConfig, TaskStatus};
    use context::ScraperContext;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Hello;

    #[async_trait]
    impl ScraperHandler for Hello {
        fn name(&self) -> String {
            "hello".into()
        }

        async fn run(&self, _context: Arc<ScraperContext>) -> Result<String> {
            Ok("hello".into())
        }
    }

    #[tokio::test]
    async fn test_embedded_server_processes_ephemeral_tasks() {
        let config = ServerConfig {
            run_api: false,
            run_scheduler: false,
            expose_metrics: false,
            workers: 2,
            ..ServerConfig::default()
        };
        let server = Server::builder(config)
            .handler(Arc::new(Hello))
            .default_middlewares()
            .build()
            .unwrap();
        assert!(server.handler_names().contains(&"hello".to_string()));

        let queue = server.queue();
        let token = server.shutdown_token();
        let run = tokio::spawn(server.run());

        let task = queue
            .enqueue(EnqueueRequest {
                scraper_id: None,
                handler: "hello".into(),
                config: ScraperConfig::default(),
                priority: Priority::Normal,
                timeout_seconds: None,
            })
            .await
            .unwrap();

        let mut done = None;
        for _ in 0..200 {
            let current = queue.get_task(task.id).await.unwrap();
            if current.is_terminal() {
                done = Some(current);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let done = done.expect("task never finished");
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.as_deref(), Some("hello"));

        token.cancel();
        run.await.unwrap().unwrap();
    }
}
