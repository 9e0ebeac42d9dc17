use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineProperties;
use crate::listener::ListenerSettings;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Passed to the capture engine as flat string properties. Nested tables
    /// become dotted keys, so `[engine.input] path = "x"` is `input.path`.
    #[serde(default)]
    pub engine: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CDC_LISTENER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.listener.shutdown_timeout_secs)
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    pub fn engine_properties(&self) -> EngineProperties {
        let mut properties = EngineProperties::new();
        flatten_into(&mut properties, None, &self.engine);
        properties
    }
}

fn flatten_into(properties: &mut EngineProperties, prefix: Option<&str>, table: &Map<String, Value>) {
    for (key, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => flatten_into(properties, Some(&key), nested),
            Value::String(s) => properties.set(key, s),
            Value::Null => {}
            other => properties.set(key, other),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}
