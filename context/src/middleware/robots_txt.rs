use std::any::Any;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use errors::{MiddlewareError, Result};
use log::{debug, error};
use robotstxt::DefaultMatcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use common::interface::Middleware;
use common::model::Request;

use crate::middleware::parse_config;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStrategy {
    /// Only log the violation and let the request through.
    #[default]
    Log,
    /// Fail the request.
    Throw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotsTxtConfig {
    pub violation_strategy: ViolationStrategy,
}

struct CachedRobots {
    /// `None` means the site has no usable robots.txt; requests are allowed.
    body: Option<String>,
    expires_at: Instant,
}

/// Checks outgoing requests against the target host's robots.txt. The file
/// is cached per host, honoring its `max-age` when present. An unavailable
/// robots.txt (non-200, timeout) fails open.
pub struct RobotsTxtMiddleware {
    client: reqwest::Client,
    cache: DashMap<String, CachedRobots>,
    default_ttl: Duration,
}

impl Default for RobotsTxtMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotsTxtMiddleware {
    pub fn new() -> Self {
        RobotsTxtMiddleware {
            client: reqwest::Client::new(),
            cache: DashMap::new(),
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }

    fn host_key(host: &str) -> String {
        host.strip_prefix("www.").unwrap_or(host).to_string()
    }

    fn cache_ttl(&self, response: &reqwest::Response) -> Duration {
        response
            .headers()
            .get("cache-control")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|age| age.parse::<u64>().ok())
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl)
    }

    async fn fetch(&self, host: &str) -> (Option<String>, Duration) {
        for scheme in ["https", "http"] {
            for prefix in ["", "www."] {
                let url = format!("{scheme}://{prefix}{host}/robots.txt");
                match self.client.get(url.as_str()).timeout(FETCH_TIMEOUT).send().await {
                    Ok(response) if response.status().as_u16() == 200 => {
                        let ttl = self.cache_ttl(&response);
                        match response.text().await {
                            Ok(body) => return (Some(body), ttl),
                            Err(e) => error!("failed to read robots.txt from {url}: {e}"),
                        }
                    }
                    Ok(response) => {
                        debug!("robots.txt at {url} returned {}", response.status());
                    }
                    Err(e) => {
                        debug!("failed to fetch robots.txt from {url}: {e}");
                    }
                }
            }
        }
        (None, self.default_ttl)
    }

    async fn load(&self, host: &str) -> Option<String> {
        let key = Self::host_key(host);
        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return cached.body.clone();
            }
        }
        let (body, ttl) = self.fetch(&key).await;
        self.cache.insert(
            key,
            CachedRobots {
                body: body.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        body
    }

    /// Seeds the cache; used by tests and warm-up tooling.
    pub fn preload(&self, host: &str, body: Option<String>) {
        self.cache.insert(
            Self::host_key(host),
            CachedRobots {
                body,
                expires_at: Instant::now() + self.default_ttl,
            },
        );
    }
}

#[async_trait]
impl Middleware for RobotsTxtMiddleware {
    fn name(&self) -> String {
        "robots_txt".into()
    }

    fn default_config(&self) -> Value {
        json!(RobotsTxtConfig::default())
    }

    async fn on_request(&self, request: Request, config: &Value) -> Result<Request> {
        let config: RobotsTxtConfig = parse_config(&self.name(), config);
        let host = match request.host() {
            Some(host) => host,
            None => return Ok(request),
        };
        let robots = match self.load(&host).await {
            Some(robots) => robots,
            None => {
                debug!("no robots.txt for {host}, defaulting to allow");
                return Ok(request);
            }
        };
        let user_agent = request.header("User-Agent").unwrap_or("*");
        let mut matcher = DefaultMatcher::default();
        if !matcher.one_agent_allowed_by_robots(&robots, user_agent, &request.url) {
            let message = format!("robots.txt prohibits requesting {}", request.url);
            match config.violation_strategy {
                ViolationStrategy::Throw => {
                    return Err(MiddlewareError::Violation {
                        name: self.name(),
                        message,
                    }
                    .into())
                }
                ViolationStrategy::Log => {
                    error!("{message}; proceeding because the strategy is log");
                }
            }
        }
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

    const ROBOTS: &str = "User-agent: *\nDisallow: /private\n";

    fn request(url: &str) -> Request {
        Request::new(HttpMethod::Get, url)
    }

    fn throw_config() -> Value {
        json!(RobotsTxtConfig {
            violation_strategy: ViolationStrategy::Throw,
        })
    }

    #[tokio::test]
    async fn test_disallowed_path_throws() {
        let middleware = RobotsTxtMiddleware::new();
        middleware.preload("example.com", Some(ROBOTS.into()));
        let err = middleware
            .on_request(request("https://example.com/private/page"), &throw_config())
            .await
            .unwrap_err();
        assert!(err.is_middleware());
        assert!(err.to_string().contains("robots.txt"));
    }

    #[tokio::test]
    async fn test_allowed_path_passes() {
        let middleware = RobotsTxtMiddleware::new();
        middleware.preload("example.com", Some(ROBOTS.into()));
        middleware
            .on_request(request("https://example.com/public"), &throw_config())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_log_strategy_lets_violation_through() {
        let middleware = RobotsTxtMiddleware::new();
        middleware.preload("example.com", Some(ROBOTS.into()));
        middleware
            .on_request(
                request("https://example.com/private/page"),
                &json!(RobotsTxtConfig::default()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_robots_fails_open() {
        let middleware = RobotsTxtMiddleware::new();
        middleware.preload("example.com", None);
        middleware
            .on_request(request("https://example.com/private/page"), &throw_config())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_www_host_shares_cache_entry() {
        let middleware = RobotsTxtMiddleware::new();
        middleware.preload("www.example.com", Some(ROBOTS.into()));
        let err = middleware
            .on_request(
                request("https://example.com/private/page"),
                &throw_config(),
            )
            .await;
        assert!(err.is_err());
    }
}
