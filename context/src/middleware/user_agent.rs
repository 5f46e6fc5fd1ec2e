use std::any::Any;

use async_trait::async_trait;
use errors::Result;
use rand::prelude::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use common::interface::Middleware;
use common::model::Request;

use crate::middleware::parse_config;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentInjectorConfig {
    /// Kept for config compatibility; this rendition always synthesizes
    /// user agents locally instead of fetching an external dataset.
    pub use_external_data: bool,
    pub browsers: Vec<String>,
}

impl Default for UserAgentInjectorConfig {
    fn default() -> Self {
        UserAgentInjectorConfig {
            use_external_data: false,
            browsers: vec!["chrome".into(), "edge".into(), "firefox".into()],
        }
    }
}

/// Injects a plausible `User-Agent` header when the request has none.
pub struct UserAgentInjectorMiddleware;

const OS_TOKENS: [&str; 5] = [
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "Macintosh; Intel Mac OS X 13_4_1",
    "Macintosh; Intel Mac OS X 14_0_1",
    "X11; Linux x86_64",
];

impl UserAgentInjectorMiddleware {
    pub fn new() -> Self {
        UserAgentInjectorMiddleware
    }

    fn synthesize(browsers: &[String]) -> String {
        let mut rng = rand::rng();
        let os = OS_TOKENS.choose(&mut rng).copied().unwrap_or(OS_TOKENS[0]);
        let browser = browsers
            .choose(&mut rng)
            .map(|b| b.to_lowercase())
            .unwrap_or_else(|| "chrome".to_string());
        match browser.as_str() {
            "firefox" => {
                let major = rng.random_range(100..=140);
                format!("Mozilla/5.0 ({os}) Gecko/20100101 Firefox/{major}.0")
            }
            "edge" => {
                let major = rng.random_range(100..=140);
                let build = rng.random_range(0..=5999);
                format!(
                    "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) \
                     Chrome/{major}.0.{build}.0 Safari/537.36 Edg/{major}.0.{build}.0"
                )
            }
            "safari" => {
                let major = rng.random_range(15..=17);
                format!(
                    "Mozilla/5.0 ({os}) AppleWebKit/605.1.15 (KHTML, like Gecko) \
                     Version/{major}.0 Safari/605.1.15"
                )
            }
            _ => {
                let major = rng.random_range(100..=130);
                let build = rng.random_range(0..=5999);
                format!(
                    "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) \
                     Chrome/{major}.0.{build}.0 Safari/537.36"
                )
            }
        }
    }
}

impl Default for UserAgentInjectorMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for UserAgentInjectorMiddleware {
    fn name(&self) -> String {
        "user_agent_injector".into()
    }

    fn default_config(&self) -> Value {
        json!(UserAgentInjectorConfig::default())
    }

    async fn on_request(&self, mut request: Request, config: &Value) -> Result<Request> {
        if request.header("User-Agent").is_some() {
            return Ok(request);
        }
        let config: UserAgentInjectorConfig = parse_config(&self.name(), config);
        request.set_header("User-Agent", Self::synthesize(&config.browsers));
        Ok(request)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
