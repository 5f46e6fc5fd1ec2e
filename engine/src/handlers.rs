use std::sync::Arc;

use async_trait::async_trait;
use errors::Result;

use context::ScraperHandler;
use queue::{TaskContext, TaskHandler};

use crate::registry::HandlerRegistry;
use crate::runner::ScraperRunner;

/// Bridges a scraper handler into the consumer's task-handler table under
/// the same name. The queue resolves tasks by the handler name captured at
/// enqueue time; each registered scraper handler gets one adapter.
pub struct ScraperTaskAdapter {
    handler: Arc<dyn ScraperHandler>,
    runner: Arc<ScraperRunner>,
}

impl ScraperTaskAdapter {
    pub fn new(handler: Arc<dyn ScraperHandler>, runner: Arc<ScraperRunner>) -> Self {
        ScraperTaskAdapter { handler, runner }
    }

    /// One adapter per handler in the registry.
    pub fn for_registry(
        registry: &HandlerRegistry,
        runner: Arc<ScraperRunner>,
    ) -> Vec<Arc<dyn TaskHandler>> {
        registry
            .all()
            .map(|handler| {
                Arc::new(ScraperTaskAdapter::new(handler.clone(), runner.clone()))
                    as Arc<dyn TaskHandler>
            })
            .collect()
    }
}

#[async_trait]
impl TaskHandler for ScraperTaskAdapter {
    fn name(&self) -> String {
        self.handler.name()
    }

    async fn process(&self, context: &TaskContext) -> Result<String> {
        self.runner.run(self.handler.clone(), context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::model::{EnqueueRequest, Priority, ScraperConfig};
    use common::TaskLogger;
    use context::{MiddlewareChain, ScraperContext};
    use std::time::Duration;
    use storage::{InMemoryLogStorage, InMemoryScraperStorage};
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl ScraperHandler for Echo {
        fn name(&self) -> String {
            "echo".into()
        }

        async fn run(&self, context: Arc<ScraperContext>) -> Result<String> {
            Ok(context.params().to_string())
        }
    }

    #[tokio::test]
    async fn test_adapter_exposes_handler_name_and_runs_it() {
        let runner = Arc::new(ScraperRunner::new(
            Arc::new(InMemoryScraperStorage::new()),
            Arc::new(MiddlewareChain::new(vec![])),
            Duration::from_secs(30),
        ));
        let registry = HandlerRegistry::new(vec![Arc::new(Echo) as Arc<dyn ScraperHandler>]);
        let adapters = ScraperTaskAdapter::for_registry(&registry, runner);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].name(), "echo");

        let task = EnqueueRequest {
            scraper_id: None,
            handler: "echo".into(),
            config: ScraperConfig::with_params(serde_json::json!({"q": 1})),
            priority: Priority::Normal,
            timeout_seconds: None,
        }
        .into_task(1, Utc::now());
        let context = TaskContext {
            task,
            token: CancellationToken::new(),
            logger: TaskLogger::new(Arc::new(InMemoryLogStorage::new()), 1),
        };
        let result = adapters[0].process(&context).await.unwrap();
        assert_eq!(result, r#"{"q":1}"#);
    }
}
