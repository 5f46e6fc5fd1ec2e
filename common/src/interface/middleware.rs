use std::any::Any;

use async_trait::async_trait;
use errors::Result;
use serde_json::Value;

use crate::model::{Request, Response};

/// A named component that intercepts outgoing requests and incoming
/// responses of the scraper HTTP client.
///
/// `config` is the effective configuration for the current scraper: the
/// middleware's defaults deep-merged with the scraper's override for this
/// middleware name. Hooks default to pass-through so functional middleware
/// (helpers without interception logic) only implement `name`.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> String;

    /// Default configuration, merged under any per-scraper override.
    fn default_config(&self) -> Value {
        Value::Null
    }

    /// Called before dispatch, in registration order. May mutate or replace
    /// the request; failing aborts the pipeline for this request.
    async fn on_request(&self, request: Request, _config: &Value) -> Result<Request> {
        Ok(request)
    }

    /// Called after dispatch, in reverse registration order. May inspect or
    /// replace the response.
    async fn on_response(
        &self,
        _request: &Request,
        response: Response,
        _config: &Value,
    ) -> Result<Response> {
        Ok(response)
    }

    /// Downcast seam so handlers can reach concrete middleware utilities
    /// (e.g. the HTML parser) through the context by name.
    fn as_any(&self) -> &dyn Any;
}
