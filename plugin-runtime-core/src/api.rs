//! Plugin API definitions and interfaces
//!
//! Defines the contract every hosted plugin implements. The base [`Plugin`]
//! trait carries the lifecycle hooks; functional roles are exposed through
//! capability accessors that return `Some` only when the plugin implements
//! that role. The host dispatches through these accessors (or the tagged
//! [`CapabilityHandle`]) and never downcasts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::context::PluginContext;
use crate::descriptor::Capability;
use crate::error::PluginResult;
use events_bus::Event;

/// Flat key/value configuration snapshot handed to a plugin at initialize time
pub type PluginConfig = BTreeMap<String, String>;

/// Main plugin interface
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once with the bound context. Keep a clone of the context if
    /// the plugin needs to publish or send later.
    async fn initialize(&self, ctx: &PluginContext) -> PluginResult<()>;

    async fn start(&self) -> PluginResult<()> {
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Release resources before the instance is dropped
    async fn cleanup(&self) -> PluginResult<()> {
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        false
    }

    async fn health_check(&self) -> PluginResult<HealthStatus> {
        Ok(HealthStatus::healthy("ok"))
    }

    fn http(&self) -> Option<&dyn HttpCapability> {
        None
    }

    fn events(&self) -> Option<&dyn EventCapability> {
        None
    }

    fn scheduled(&self) -> Option<&dyn ScheduledCapability> {
        None
    }

    fn data(&self) -> Option<&dyn DataCapability> {
        None
    }

    fn configurable(&self) -> Option<&dyn ConfigurableCapability> {
        None
    }

    /// Tagged view over the capability accessors
    fn capability(&self, kind: Capability) -> Option<CapabilityHandle<'_>> {
        match kind {
            Capability::Http => self.http().map(CapabilityHandle::Http),
            Capability::Event => self.events().map(CapabilityHandle::Event),
            Capability::Scheduled => self.scheduled().map(CapabilityHandle::Scheduled),
            Capability::Data => self.data().map(CapabilityHandle::Data),
            Capability::Configurable => self.configurable().map(CapabilityHandle::Configurable),
        }
    }
}

/// Borrowed handle to one implemented capability
pub enum CapabilityHandle<'a> {
    Http(&'a dyn HttpCapability),
    Event(&'a dyn EventCapability),
    Scheduled(&'a dyn ScheduledCapability),
    Data(&'a dyn DataCapability),
    Configurable(&'a dyn ConfigurableCapability),
}

impl CapabilityHandle<'_> {
    pub fn kind(&self) -> Capability {
        match self {
            Self::Http(_) => Capability::Http,
            Self::Event(_) => Capability::Event,
            Self::Scheduled(_) => Capability::Scheduled,
            Self::Data(_) => Capability::Data,
            Self::Configurable(_) => Capability::Configurable,
        }
    }
}

#[async_trait]
pub trait HttpCapability: Send + Sync {
    fn routes(&self) -> Vec<HttpRoute>;

    async fn handle_request(&self, request: HttpRequest) -> PluginResult<HttpResponse>;
}

#[async_trait]
pub trait EventCapability: Send + Sync {
    /// Event types the plugin is subscribed to while started
    fn subscriptions(&self) -> Vec<String>;

    async fn on_event(&self, event: &Event) -> PluginResult<()>;
}

#[async_trait]
pub trait ScheduledCapability: Send + Sync {
    fn interval(&self) -> Duration;

    async fn run_scheduled(&self) -> PluginResult<()>;
}

#[async_trait]
pub trait DataCapability: Send + Sync {
    async fn process(&self, input: serde_json::Value) -> PluginResult<serde_json::Value>;
}

#[async_trait]
pub trait ConfigurableCapability: Send + Sync {
    fn config_schema(&self) -> Vec<ConfigField>;

    async fn on_config_changed(&self, config: &PluginConfig) -> PluginResult<()>;
}

/// One key of a configurable plugin's schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ConfigField {
    pub fn required(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            required: false,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    pub method: String,
    pub path: String,
}

impl HttpRoute {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: serde_json::Value::Null,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: BTreeMap::new(),
            body: serde_json::json!({"error": "not found"}),
        }
    }
}

/// Health status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall health status
    pub status: HealthLevel,
    /// Status message
    pub message: String,
    /// Detailed checks
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    /// Check timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthStatus {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_level(HealthLevel::Healthy, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_level(HealthLevel::Unhealthy, message)
    }

    pub fn with_level(status: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            checks: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }
}

/// Health level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Plugin is healthy and ready
    Healthy,
    /// Plugin has warnings but is functional
    Warning,
    /// Plugin is unhealthy and may not function properly
    Unhealthy,
    /// No check has completed yet
    Unknown,
}

/// Individual health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthLevel,
    pub message: String,
    pub duration_ms: u64,
}
