use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use errors::{Error, Result};
use futures::future::BoxFuture;
use log::debug;
use metrics::counter;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::model::{
    HttpMethod, Request, RequestBody, Response, ScraperConfig,
};
use common::TaskLogger;

use crate::chain::MiddlewareChain;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback persisting updated scraper state between runs.
pub type StateUpdater =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-task facade handed to handlers: HTTP verbs mediated by the
/// middleware chain, the scraper's params, named middleware access and the
/// task log sink. Every HTTP call is a cancellation checkpoint.
pub struct ScraperContext {
    params: Value,
    overrides: BTreeMap<String, Value>,
    chain: Arc<MiddlewareChain>,
    default_client: reqwest::Client,
    /// Proxied requests need their own client; reqwest binds proxies at
    /// build time, so clients are cached per proxy URL.
    proxy_clients: DashMap<String, reqwest::Client>,
    token: CancellationToken,
    logger: Option<TaskLogger>,
    request_timeout: Duration,
    state: Option<String>,
    state_updater: Option<StateUpdater>,
}

pub struct ScraperContextBuilder {
    config: ScraperConfig,
    chain: Arc<MiddlewareChain>,
    token: CancellationToken,
    logger: Option<TaskLogger>,
    request_timeout: Duration,
    state: Option<String>,
    state_updater: Option<StateUpdater>,
}

impl ScraperContextBuilder {
    pub fn new(config: ScraperConfig, chain: Arc<MiddlewareChain>) -> Self {
        ScraperContextBuilder {
            config,
            chain,
            token: CancellationToken::new(),
            logger: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: None,
            state_updater: None,
        }
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn logger(mut self, logger: TaskLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn state(mut self, state: Option<String>) -> Self {
        self.state = state;
        self
    }

    pub fn state_updater(mut self, updater: StateUpdater) -> Self {
        self.state_updater = Some(updater);
        self
    }

    pub fn build(self) -> Result<ScraperContext> {
        let overrides = self.config.middleware.unwrap_or_default();
        self.chain.warn_unknown_overrides(&overrides);
        let default_client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::http)?;
        Ok(ScraperContext {
            params: self.config.params.unwrap_or(Value::Null),
            overrides,
            chain: self.chain,
            default_client,
            proxy_clients: DashMap::new(),
            token: self.token,
            logger: self.logger,
            request_timeout: self.request_timeout,
            state: self.state,
            state_updater: self.state_updater,
        })
    }
}

impl ScraperContext {
    pub fn builder(config: ScraperConfig, chain: Arc<MiddlewareChain>) -> ScraperContextBuilder {
        ScraperContextBuilder::new(config, chain)
    }

    /// The scraper config's `params`, as given by the user.
    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn logger(&self) -> Option<&TaskLogger> {
        self.logger.as_ref()
    }

    /// Scraper state persisted by a previous run, if any.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Persists new scraper state for the next run. A no-op with a warning
    /// for ephemeral runs, which have nowhere to keep state.
    pub async fn update_state(&self, state: String) -> Result<()> {
        match &self.state_updater {
            Some(updater) => updater(state).await,
            None => {
                log::warn!("tried to update scraper state, but this run has no backing scraper");
                Ok(())
            }
        }
    }

    /// Typed access to a registered middleware, for functional middleware
    /// that expose helpers (e.g. the HTML parser).
    pub fn middleware<T: 'static>(&self, name: &str) -> Option<&T> {
        self.chain.find(name)?.as_any().downcast_ref::<T>()
    }

    pub fn middleware_names(&self) -> Vec<String> {
        self.chain.names()
    }

    pub async fn get(&self, url: impl AsRef<str>) -> Result<Response> {
        self.request(Request::new(HttpMethod::Get, url)).await
    }

    pub async fn head(&self, url: impl AsRef<str>) -> Result<Response> {
        self.request(Request::new(HttpMethod::Head, url)).await
    }

    pub async fn delete(&self, url: impl AsRef<str>) -> Result<Response> {
        self.request(Request::new(HttpMethod::Delete, url)).await
    }

    pub async fn options(&self, url: impl AsRef<str>) -> Result<Response> {
        self.request(Request::new(HttpMethod::Options, url)).await
    }

    pub async fn post(&self, url: impl AsRef<str>, body: Option<RequestBody>) -> Result<Response> {
        let mut request = Request::new(HttpMethod::Post, url);
        request.body = body;
        self.request(request).await
    }

    pub async fn put(&self, url: impl AsRef<str>, body: Option<RequestBody>) -> Result<Response> {
        let mut request = Request::new(HttpMethod::Put, url);
        request.body = body;
        self.request(request).await
    }

    pub async fn patch(&self, url: impl AsRef<str>, body: Option<RequestBody>) -> Result<Response> {
        let mut request = Request::new(HttpMethod::Patch, url);
        request.body = body;
        self.request(request).await
    }

    /// Runs the full middleware pipeline around one HTTP request. A
    /// middleware asking for retry-after pauses and restarts the pipeline,
    /// bounded per middleware by the chain's retry bound.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let mut retries: HashMap<String, usize> = HashMap::new();
        loop {
            match self.attempt(request.clone()).await {
                Err(e) => {
                    if let Some((name, after)) = e.retry_after() {
                        let count = retries.entry(name.clone()).or_insert(0);
                        *count += 1;
                        if *count > self.chain.retry_bound() {
                            return Err(e);
                        }
                        debug!(
                            "middleware {name} requested retry {count}/{} after {after:?}",
                            self.chain.retry_bound()
                        );
                        tokio::select! {
                            _ = self.token.cancelled() => return Err(Error::cancelled()),
                            _ = sleep(after) => {}
                        }
                        continue;
                    }
                    return Err(e);
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&self, request: Request) -> Result<Response> {
        let request = self.chain.on_request(request, &self.overrides).await?;
        if self.token.is_cancelled() {
            return Err(Error::cancelled());
        }
        let response = self.dispatch(&request).await?;
        // On cancellation the dispatch already bailed out; response hooks
        // only run for requests that actually completed.
        self.chain.on_response(&request, response, &self.overrides).await
    }

    async fn dispatch(&self, request: &Request) -> Result<Response> {
        let client = self.client_for(request)?;
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };
        let mut builder = client.request(method, request.url.as_str());
        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(query) = &request.query {
            builder = builder.query(query);
        }
        match &request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(value),
            Some(RequestBody::Form(pairs)) => builder = builder.form(pairs),
            Some(RequestBody::Bytes(bytes)) => builder = builder.body(bytes.clone()),
            Some(RequestBody::Text(text)) => builder = builder.body(text.clone()),
            None => {}
        }
        builder = builder.timeout(request.timeout().unwrap_or(self.request_timeout));

        counter!("http_requests_total", "method" => request.method.as_str()).increment(1);
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::cancelled()),
            outcome = builder.send() => outcome
                .map(Response::from_reqwest)
                .map_err(Error::http),
        }
    }

    fn client_for(&self, request: &Request) -> Result<reqwest::Client> {
        let spec = match &request.proxy {
            None => return Ok(self.default_client.clone()),
            Some(spec) => spec,
        };
        if let Some(client) = self.proxy_clients.get(&spec.url) {
            return Ok(client.clone());
        }
        let mut proxy = reqwest::Proxy::all(&spec.url).map_err(Error::http)?;
        if let Some((user, pass)) = &spec.auth {
            proxy = proxy.basic_auth(user, pass);
        }
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::http)?;
        self.proxy_clients.insert(spec.url.clone(), client.clone());
        Ok(client)
    }
}
