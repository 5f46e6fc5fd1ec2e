pub mod logging;
pub mod parser;
pub mod proxy;
pub mod rate_limiter;
pub mod robots_txt;
pub mod user_agent;

use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parses the effective config into the middleware's typed form, falling
/// back to defaults when the config does not parse. A malformed override
/// must not take a scraper down.
pub(crate) fn parse_config<T: DeserializeOwned + Default>(name: &str, config: &Value) -> T {
    if config.is_null() {
        return T::default();
    }
    match serde_json::from_value(config.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("failed to parse config for middleware '{name}': {e}");
            T::default()
        }
    }
}
