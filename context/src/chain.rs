use std::collections::BTreeMap;
use std::sync::Arc;

use errors::Result;
use log::warn;
use metrics::counter;
use serde_json::Value;

use common::interface::Middleware;
use common::model::{merge_json, Request, Response};

/// Ordered middleware pipeline. Request hooks run in registration order,
/// response hooks in reverse, and each hook sees the effective config for
/// the current scraper (middleware defaults deep-merged with the scraper's
/// override for that name).
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    /// How many pipeline restarts a single middleware may request before
    /// its retry-after is surfaced as an error.
    retry_bound: usize,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        MiddlewareChain {
            middlewares,
            retry_bound: 3,
        }
    }

    pub fn with_retry_bound(mut self, retry_bound: usize) -> Self {
        self.retry_bound = retry_bound;
        self
    }

    pub fn retry_bound(&self) -> usize {
        self.retry_bound
    }

    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Middleware>> {
        self.middlewares.iter().find(|m| m.name() == name)
    }

    /// Logs overrides that reference no registered middleware; a typo in a
    /// scraper config is a warning, not a failure.
    pub fn warn_unknown_overrides(&self, overrides: &BTreeMap<String, Value>) {
        for name in overrides.keys() {
            if self.find(name).is_none() {
                warn!("middleware override '{name}' does not match any registered middleware");
            }
        }
    }

    fn effective_config(
        &self,
        middleware: &dyn Middleware,
        overrides: &BTreeMap<String, Value>,
    ) -> Value {
        let default = middleware.default_config();
        match overrides.get(&middleware.name()) {
            Some(overlay) => merge_json(&default, overlay),
            None => default,
        }
    }

    pub async fn on_request(
        &self,
        mut request: Request,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Request> {
        for middleware in &self.middlewares {
            let config = self.effective_config(middleware.as_ref(), overrides);
            counter!("middleware_invocations_total", "name" => middleware.name(), "stage" => "request")
                .increment(1);
            request = middleware.on_request(request, &config).await?;
        }
        Ok(request)
    }

    pub async fn on_response(
        &self,
        request: &Request,
        mut response: Response,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Response> {
        for middleware in self.middlewares.iter().rev() {
            let config = self.effective_config(middleware.as_ref(), overrides);
            counter!("middleware_invocations_total", "name" => middleware.name(), "stage" => "response")
                .increment(1);
            response = middleware.on_response(request, response, &config).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::model::HttpMethod;
    use errors::MiddlewareError;
    use std::any::Any;
    use std::sync::Mutex;

    /// Records hook invocations so tests can assert ordering.
    struct Recorder {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn on_request(&self, request: Request, _config: &Value) -> Result<Request> {
            self.calls.lock().unwrap().push(format!("{}:request", self.name));
            if self.fail_request {
                return Err(MiddlewareError::Violation {
                    name: self.name.clone(),
                    message: "rejected".into(),
                }
                .into());
            }
            Ok(request)
        }

        async fn on_response(
            &self,
            _request: &Request,
            response: Response,
            _config: &Value,
        ) -> Result<Response> {
            self.calls.lock().unwrap().push(format!("{}:response", self.name));
            Ok(response)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn chain_of(
        names: &[&str],
        failing: Option<&str>,
        calls: Arc<Mutex<Vec<String>>>,
    ) -> MiddlewareChain {
        MiddlewareChain::new(
            names
                .iter()
                .map(|name| {
                    Arc::new(Recorder {
                        name: name.to_string(),
                        calls: calls.clone(),
                        fail_request: failing == Some(*name),
                    }) as Arc<dyn Middleware>
                })
                .collect(),
        )
    }

    fn response() -> Response {
        Response::from_parts(200, Default::default(), "https://x", Default::default())
    }

    #[tokio::test]
    async fn test_request_order_and_response_reverse() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&["ua", "proxy", "logging"], None, calls.clone());
        let overrides = BTreeMap::new();

        let request = Request::new(HttpMethod::Get, "https://x");
        let request = chain.on_request(request, &overrides).await.unwrap();
        chain
            .on_response(&request, response(), &overrides)
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "ua:request",
                "proxy:request",
                "logging:request",
                "logging:response",
                "proxy:response",
                "ua:response",
            ]
        );
    }

    #[tokio::test]
    async fn test_violation_stops_pipeline() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&["ua", "proxy", "logging"], Some("proxy"), calls.clone());
        let overrides = BTreeMap::new();

        let err = chain
            .on_request(Request::new(HttpMethod::Get, "https://x"), &overrides)
            .await
            .unwrap_err();
        assert!(err.is_middleware());

        // Middleware after the failing one never ran.
        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["ua:request", "proxy:request"]);
    }

    #[tokio::test]
    async fn test_find_and_names() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&["ua", "logging"], None, calls);
        assert_eq!(chain.names(), vec!["ua", "logging"]);
        assert!(chain.find("ua").is_some());
        assert!(chain.find("missing").is_none());
    }
}
