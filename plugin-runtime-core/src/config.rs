//! Runtime configuration
//!
//! Every section is defaulted, so an empty file (or none at all) yields a
//! working runtime. Values are layered: optional file first, then
//! environment variables prefixed `PLUGIN_RUNTIME`, nested with `__`, e.g.
//! `PLUGIN_RUNTIME__LIFECYCLE__OPERATION_TIMEOUT_MS=5000`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use audit_engine::AuditConfig;
use events_bus::{BrokerConfig, EventBusConfig};

use crate::error::PluginResult;
use crate::health::HealthConfig;
use crate::lifecycle::LifecycleConfig;
use crate::registry::RegistryConfig;
use crate::security::SecurityConfig;

pub const ENV_PREFIX: &str = "PLUGIN_RUNTIME";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub security: SecurityConfig,
    pub registry: RegistryConfig,
    pub audit: AuditConfig,
    pub event_bus: EventBusConfig,
    pub broker: BrokerConfig,
}

impl RuntimeConfig {
    /// Load from an optional YAML/TOML/JSON file overlaid with environment
    /// variables.
    pub fn load(path: Option<&Path>) -> PluginResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
