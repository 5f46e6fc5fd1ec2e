use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_api_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_workers() -> usize {
    50
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_pool_size() -> usize {
    100
}

/// Storage backend selection. In-memory is single-process and meant for
/// development; Redis is shared across nodes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StorageConfig {
    #[default]
    InMemory,
    Redis(RedisConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub redis_host: String,
    pub redis_port: u16,
    #[serde(default)]
    pub redis_db: u16,
    #[serde(default)]
    pub redis_username: Option<String>,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Scheduler tunables; the defaults match the documented operational
/// expectations (60s lease, 5s poll, 10s reaper, hourly GC, retention 50).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Granularity of the serial job loop.
    pub tick: Duration,
    /// How often scrapers are re-read and triggers evaluated.
    pub poll_delay: Duration,
    pub reaper_interval: Duration,
    pub gc_interval: Duration,
    pub metrics_interval: Duration,
    /// A started task silent for longer than this is written off as dead.
    pub dead_threshold: Duration,
    /// Terminal tasks kept per scraper by the history GC.
    pub retention: usize,
    /// Pending tasks per priority class above which fires are skipped.
    pub backpressure_high_water: u64,
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick: Duration::from_secs(1),
            poll_delay: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(10),
            gc_interval: Duration::from_secs(3600),
            metrics_interval: Duration::from_secs(5),
            dead_threshold: queue::DEFAULT_DEAD_THRESHOLD,
            retention: queue::DEFAULT_RETENTION,
            backpressure_high_water: 1000,
            lease_ttl: crate::lease::DEFAULT_LEASE_TTL,
        }
    }
}

/// Top-level server configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_port: u16,
    pub metrics_port: u16,
    /// Worker loops in the consumer pool.
    pub workers: usize,
    /// Default per-request HTTP timeout inside scraper contexts.
    pub request_timeout_seconds: u64,
    pub storage: StorageConfig,
    pub read_only: bool,
    pub run_api: bool,
    pub run_worker: bool,
    pub run_scheduler: bool,
    pub expose_metrics: bool,
    pub scheduler_poll_delay_seconds: u64,
    pub scheduler_lease_ttl_seconds: u64,
    pub task_retention: usize,
    pub backpressure_high_water: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            api_port: default_api_port(),
            metrics_port: default_metrics_port(),
            workers: default_workers(),
            request_timeout_seconds: default_request_timeout_seconds(),
            storage: StorageConfig::InMemory,
            read_only: false,
            run_api: true,
            run_worker: true,
            run_scheduler: true,
            expose_metrics: true,
            scheduler_poll_delay_seconds: 5,
            scheduler_lease_ttl_seconds: 60,
            task_retention: queue::DEFAULT_RETENTION,
            backpressure_high_water: 1000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        toml::from_str(&raw).map_err(|e| e.to_string())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_delay: Duration::from_secs(self.scheduler_poll_delay_seconds),
            lease_ttl: Duration::from_secs(self.scheduler_lease_ttl_seconds),
            retention: self.task_retention,
            backpressure_high_water: self.backpressure_high_water,
            ..SchedulerConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.workers, 50);
        assert!(matches!(config.storage, StorageConfig::InMemory));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = r#"
            api_port = 9000
            workers = 8

            [storage]
            backend = "redis"
            redis_host = "127.0.0.1"
            redis_port = 6379
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.workers, 8);
        match &config.storage {
            StorageConfig::Redis(redis) => {
                assert_eq!(redis.redis_host, "127.0.0.1");
                assert_eq!(redis.pool_size, 100);
            }
            other => panic!("expected redis storage, got {other:?}"),
        }
    }
}
