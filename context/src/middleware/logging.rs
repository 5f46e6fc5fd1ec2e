use std::any::Any;

use async_trait::async_trait;
use errors::Result;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use common::interface::Middleware;
use common::model::{Request, Response};

use crate::middleware::parse_config;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLoggingConfig {
    pub log_request: bool,
    pub log_response: bool,
}

impl Default for RequestLoggingConfig {
    fn default() -> Self {
        RequestLoggingConfig {
            log_request: true,
            log_response: true,
        }
    }
}

/// Logs requests as they are dispatched and responses as they return.
/// Bodies are left alone so streaming responses stay streaming.
pub struct RequestLoggingMiddleware;

impl RequestLoggingMiddleware {
    pub fn new() -> Self {
        RequestLoggingMiddleware
    }
}

impl Default for RequestLoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for RequestLoggingMiddleware {
    fn name(&self) -> String {
        "request_logging".into()
    }

    fn default_config(&self) -> Value {
        json!(RequestLoggingConfig::default())
    }

    async fn on_request(&self, request: Request, config: &Value) -> Result<Request> {
        let config: RequestLoggingConfig = parse_config(&self.name(), config);
        if config.log_request {
            info!("{} {}", request.method, request.url);
        }
        Ok(request)
    }

    async fn on_response(
        &self,
        request: &Request,
        response: Response,
        config: &Value,
    ) -> Result<Response> {
        let config: RequestLoggingConfig = parse_config(&self.name(), config);
        if config.log_response {
            info!("{} {} - {}", request.method, request.url, response.status());
        }
        Ok(response)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
