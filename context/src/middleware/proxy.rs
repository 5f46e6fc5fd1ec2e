use std::any::Any;

use async_trait::async_trait;
use errors::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use common::interface::Middleware;
use common::model::{ProxySpec, Request};

use crate::middleware::parse_config;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy URL; no proxy is attached when absent.
    pub proxy: Option<String>,
    pub proxy_auth: Option<ProxyAuth>,
}

/// Routes all outgoing requests through a configured HTTP proxy.
pub struct ProxyMiddleware;

impl ProxyMiddleware {
    pub fn new() -> Self {
        ProxyMiddleware
    }
}

impl Default for ProxyMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ProxyMiddleware {
    fn name(&self) -> String {
        "proxy".into()
    }

    fn default_config(&self) -> Value {
        json!(ProxyConfig::default())
    }

    async fn on_request(&self, mut request: Request, config: &Value) -> Result<Request> {
        let config: ProxyConfig = parse_config(&self.name(), config);
        if let Some(url) = config.proxy {
            request.proxy = Some(ProxySpec {
                url,
                auth: config.proxy_auth.map(|auth| (auth.user, auth.pass)),
            });
        }
        Ok(request)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
