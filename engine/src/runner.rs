use std::sync::Arc;
use std::time::Duration;

use errors::Result;
use log::{info, warn};

use common::interface::ScraperStorage;
use context::{MiddlewareChain, ScraperContext, ScraperHandler, StateUpdater};
use queue::TaskContext;

/// Builds scraper contexts and drives handlers through them.
///
/// The task's captured config is what the context sees; the scraper record
/// only contributes its persisted state. Editing a scraper never changes a
/// run that is already queued.
pub struct ScraperRunner {
    scrapers: Arc<dyn ScraperStorage>,
    chain: Arc<MiddlewareChain>,
    request_timeout: Duration,
}

impl ScraperRunner {
    pub fn new(
        scrapers: Arc<dyn ScraperStorage>,
        chain: Arc<MiddlewareChain>,
        request_timeout: Duration,
    ) -> Self {
        ScraperRunner {
            scrapers,
            chain,
            request_timeout,
        }
    }

    pub async fn run(
        &self,
        handler: Arc<dyn ScraperHandler>,
        task_context: &TaskContext,
    ) -> Result<String> {
        let task = &task_context.task;
        info!(
            "running handler {} for task id={} ({})",
            handler.name(),
            task.id,
            task.scraper_key()
        );

        let mut builder = ScraperContext::builder(task.config.clone(), self.chain.clone())
            .token(task_context.token.clone())
            .logger(task_context.logger.clone())
            .request_timeout(self.request_timeout);

        if let Some(scraper_id) = task.scraper_id {
            match self.scrapers.maybe_get(scraper_id).await? {
                Some(scraper) => {
                    builder = builder
                        .state(scraper.state.clone())
                        .state_updater(self.state_updater(scraper_id));
                }
                None => {
                    // The scraper was deleted after this task was enqueued;
                    // the run proceeds statelessly on the captured config.
                    warn!(
                        "scraper {scraper_id} for task id={} no longer exists",
                        task.id
                    );
                }
            }
        }

        let context = Arc::new(builder.build()?);
        handler.run(context).await
    }

    fn state_updater(&self, scraper_id: uuid::Uuid) -> StateUpdater {
        let scrapers = self.scrapers.clone();
        Arc::new(
            move |state: String| -> futures::future::BoxFuture<'static, Result<()>> {
                let scrapers = scrapers.clone();
                Box::pin(async move {
                    let mut scraper = scrapers.get(scraper_id).await?;
                    scraper.state = Some(state);
                    scrapers.update(scraper).await.map(|_| ())
                })
            },
        )
    }
}
