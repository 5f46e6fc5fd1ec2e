use std::sync::Arc;

use async_trait::async_trait;
use errors::Result;

use crate::context::ScraperContext;

/// User-supplied scrape logic, looked up by name from the handler registry.
#[async_trait]
pub trait ScraperHandler: Send + Sync {
    fn name(&self) -> String;

    /// Runs the scrape. The returned string is persisted as the task result
    /// and should stay small enough to read in the UI.
    async fn run(&self, context: Arc<ScraperContext>) -> Result<String>;
}

impl std::fmt::Debug for dyn ScraperHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScraperHandler").field("name", &self.name()).finish()
    }
}
