use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scraper configuration. `params` is handed to the handler untouched;
/// `middleware` maps a middleware name to a partial config that is deeply
/// merged over that middleware's defaults at request time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<BTreeMap<String, Value>>,
}

impl ScraperConfig {
    pub fn with_params(params: Value) -> Self {
        ScraperConfig {
            params: Some(params),
            middleware: None,
        }
    }

    pub fn middleware_override(&self, name: &str) -> Option<&Value> {
        self.middleware.as_ref().and_then(|m| m.get(name))
    }
}

/// Deep merge of JSON values: objects merge recursively, everything else
/// (scalars and arrays) is replaced by the overriding value. `Null`
/// overrides are ignored so partial configs can omit keys.
pub fn merge_json(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                match merged.get(key) {
                    Some(existing) => {
                        merged.insert(key.clone(), merge_json(existing, value));
                    }
                    None => {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}
