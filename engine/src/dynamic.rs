use std::sync::Arc;

use async_trait::async_trait;
use errors::{HandlerError, Result};
use serde::Deserialize;
use serde_json::Value;

use context::{ScraperContext, ScraperHandler};
use js_sandbox::HostEnv;

pub const DYNAMIC_SCRAPER_HANDLER_NAME: &str = "dynamic_scraper";

#[derive(Debug, Deserialize)]
struct DynamicScraperParams {
    source_code: String,
    #[serde(default)]
    kwargs: Value,
}

/// Runs user-supplied source from `params.source_code` in the sandbox.
/// The source must define `handler(ctx, kwargs)`; `params.kwargs` is
/// passed through as the second argument.
pub struct DynamicScraperHandler;

impl DynamicScraperHandler {
    pub fn new() -> Self {
        DynamicScraperHandler
    }
}

impl Default for DynamicScraperHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScraperHandler for DynamicScraperHandler {
    fn name(&self) -> String {
        DYNAMIC_SCRAPER_HANDLER_NAME.to_string()
    }

    async fn run(&self, context: Arc<ScraperContext>) -> Result<String> {
        let params: DynamicScraperParams = serde_json::from_value(context.params().clone())
            .map_err(|e| HandlerError::InvalidParams(e.to_string().into()))?;

        let handle = tokio::runtime::Handle::current();
        let env = HostEnv {
            ctx: context,
            kwargs: params.kwargs,
            handle,
        };
        // V8 wants a thread it can block; evaluation never runs on the
        // async workers.
        tokio::task::spawn_blocking(move || js_sandbox::evaluate(&params.source_code, env))
            .await
            .map_err(|e| HandlerError::Failed(e.to_string().into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::ScraperConfig;
    use context::MiddlewareChain;
    use serde_json::json;

    fn context(params: Value) -> Arc<ScraperContext> {
        Arc::new(
            ScraperContext::builder(
                ScraperConfig {
                    params: Some(params),
                    middleware: None,
                },
                Arc::new(MiddlewareChain::new(vec![])),
            )
            .build()
            .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dynamic_handler_runs_source() {
        let handler = DynamicScraperHandler::new();
        let params = json!({
            "source_code": "function handler(ctx, kwargs) { return 'got ' + kwargs.n; }",
            "kwargs": {"n": 7},
        });
        let result = handler.run(context(params)).await.unwrap();
        assert_eq!(result, "got 7");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_source_code_is_invalid_params() {
        let handler = DynamicScraperHandler::new();
        let err = handler.run(context(json!({}))).await.unwrap_err();
        assert!(err.is_handler());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_evaluation_failure_fails_task() {
        let handler = DynamicScraperHandler::new();
        let params = json!({"source_code": "this is not javascript"});
        let err = handler.run(context(params)).await.unwrap_err();
        assert!(matches!(err.kind(), errors::ErrorKind::Sandbox));
    }
}
