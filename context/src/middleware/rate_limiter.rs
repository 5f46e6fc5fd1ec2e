use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use errors::{MiddlewareError, Result};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;

use common::interface::Middleware;
use common::model::Request;

use crate::middleware::parse_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitedStrategy {
    /// Block the caller until a slot frees up.
    #[default]
    Wait,
    /// Fail the request immediately.
    Throw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Allowed requests per host within the time window.
    pub max_requests: usize,
    pub time_window_seconds: u64,
    pub rate_limited_strategy: RateLimitedStrategy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            max_requests: 60,
            time_window_seconds: 60,
            rate_limited_strategy: RateLimitedStrategy::Wait,
        }
    }
}

/// Leaky bucket: timestamps of admitted requests within the window.
struct Bucket {
    admitted: VecDeque<Instant>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            admitted: VecDeque::new(),
        }
    }

    /// Tries to admit a request now. Returns when the next slot frees up
    /// if the bucket is full.
    fn try_admit(&mut self, size: usize, window: Duration) -> Option<Instant> {
        let now = Instant::now();
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() < size {
            self.admitted.push_back(now);
            return None;
        }
        self.admitted.front().map(|front| *front + window)
    }
}

/// Leaky-bucket rate limiter per host. Buckets are keyed by host and
/// effective limits, so scrapers with different overrides for the same
/// host do not share a budget.
pub struct RateLimiterMiddleware {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl Default for RateLimiterMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterMiddleware {
    pub fn new() -> Self {
        RateLimiterMiddleware {
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new())))
            .clone()
    }

    async fn wait_for_admission(&self, host: &str, config: &RateLimiterConfig) -> Result<()> {
        let window = Duration::from_secs(config.time_window_seconds.max(1));
        let size = config.max_requests.max(1);
        let key = format!("{host}:{size}:{}", window.as_secs());
        let bucket = self.bucket(&key);
        loop {
            let next_slot = {
                let mut bucket = bucket.lock().await;
                bucket.try_admit(size, window)
            };
            let next_slot = match next_slot {
                None => return Ok(()),
                Some(at) => at,
            };
            let message = format!(
                "rate limited request to host '{host}': more than {size} calls in the last {}s",
                window.as_secs()
            );
            if config.rate_limited_strategy == RateLimitedStrategy::Throw {
                return Err(MiddlewareError::RateLimited { message }.into());
            }
            info!("{message}; waiting for a slot");
            let jitter = Duration::from_millis(rand::rng().random_range(0..500));
            let delay = next_slot.saturating_duration_since(Instant::now()) + jitter;
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl Middleware for RateLimiterMiddleware {
    fn name(&self) -> String {
        "rate_limiter".into()
    }

    fn default_config(&self) -> Value {
        json!(RateLimiterConfig::default())
    }

    async fn on_request(&self, request: Request, config: &Value) -> Result<Request> {
        let config: RateLimiterConfig = parse_config(&self.name(), config);
        let host = match request.host() {
            Some(host) => host,
            None => return Ok(request),
        };
        self.wait_for_admission(&host, &config).await?;
        Ok(request)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::HttpMethod;

    fn config(max: usize, window_secs: u64, strategy: RateLimitedStrategy) -> Value {
        json!(RateLimiterConfig {
            max_requests: max,
            time_window_seconds: window_secs,
            rate_limited_strategy: strategy,
        })
    }

    fn request() -> Request {
        Request::new(HttpMethod::Get, "https://example.com/page")
    }

    #[tokio::test]
    async fn test_throw_at_capacity() {
        let limiter = RateLimiterMiddleware::new();
        let config = config(2, 60, RateLimitedStrategy::Throw);
        limiter.on_request(request(), &config).await.unwrap();
        limiter.on_request(request(), &config).await.unwrap();
        let err = limiter.on_request(request(), &config).await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_window_passes() {
        let limiter = RateLimiterMiddleware::new();
        let config = config(1, 1, RateLimitedStrategy::Wait);
        let started = Instant::now();
        limiter.on_request(request(), &config).await.unwrap();
        limiter.on_request(request(), &config).await.unwrap();
        // The second call had to wait for the remainder of the window.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_hosts_are_limited_independently() {
        let limiter = RateLimiterMiddleware::new();
        let config = config(1, 60, RateLimitedStrategy::Throw);
        limiter.on_request(request(), &config).await.unwrap();
        let other = Request::new(HttpMethod::Get, "https://other.example.org/");
        limiter.on_request(other, &config).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_limits_get_distinct_buckets() {
        let limiter = RateLimiterMiddleware::new();
        let tight = config(1, 60, RateLimitedStrategy::Throw);
        let loose = config(10, 60, RateLimitedStrategy::Throw);
        limiter.on_request(request(), &tight).await.unwrap();
        // A scraper with a looser override still has budget for this host.
        limiter.on_request(request(), &loose).await.unwrap();
        // The tight bucket stays exhausted.
        assert!(limiter.on_request(request(), &tight).await.is_err());
    }

    #[tokio::test]
    async fn test_requests_without_host_pass_through() {
        let limiter = RateLimiterMiddleware::new();
        let config = config(1, 60, RateLimitedStrategy::Throw);
        let odd = Request::new(HttpMethod::Get, "not-a-url");
        limiter.on_request(odd.clone(), &config).await.unwrap();
        limiter.on_request(odd, &config).await.unwrap();
    }
}
