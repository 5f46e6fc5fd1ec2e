use std::collections::HashMap;
use std::sync::Arc;

use context::ScraperHandler;
use errors::{HandlerError, Result};

/// Name-indexed scraper handlers. Built once at server construction and
/// immutable afterwards.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ScraperHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn ScraperHandler>>) -> Self {
        HandlerRegistry {
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ScraperHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| HandlerError::Unknown(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ScraperHandler>> {
        self.handlers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use context::ScraperContext;

    struct Dummy(&'static str);

    #[async_trait]
    impl ScraperHandler for Dummy {
        fn name(&self) -> String {
            self.0.to_string()
        }

        async fn run(&self, _context: Arc<ScraperContext>) -> Result<String> {
            Ok("ok".into())
        }
    }

    #[test]
    fn test_lookup() {
        let registry = HandlerRegistry::new(vec![
            Arc::new(Dummy("news_handler")) as Arc<dyn ScraperHandler>,
            Arc::new(Dummy("price_handler")),
        ]);
        assert!(registry.get("news_handler").is_ok());
        assert!(registry.contains("price_handler"));
        let err = registry.get("missing").unwrap_err();
        assert!(err.is_validation());
        assert_eq!(registry.names(), vec!["news_handler", "price_handler"]);
    }
}
