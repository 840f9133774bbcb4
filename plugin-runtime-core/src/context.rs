//! Per-plugin execution context
//!
//! The lifecycle manager binds one context to a plugin at initialize time and
//! drops it on unregister. Plugins receive a reference and may clone it;
//! every outbound event or message sent through the transport is stamped
//! with the owning plugin's id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use events_bus::{Event, EventBus, Message, MessageBroker, MessageHandler};
use tracing::debug;

use crate::api::PluginConfig;
use crate::error::PluginResult;

#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    config: PluginConfig,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    transport: PluginTransport,
}

impl PluginContext {
    pub fn new(
        plugin_id: impl Into<String>,
        config: PluginConfig,
        data_dir: PathBuf,
        temp_dir: PathBuf,
        transport: PluginTransport,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            config,
            data_dir,
            temp_dir,
            transport,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn transport(&self) -> &PluginTransport {
        &self.transport
    }

    pub(crate) fn replace_config(&mut self, config: PluginConfig) {
        self.config = config;
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("config_keys", &self.config.keys().collect::<Vec<_>>())
            .field("data_dir", &self.data_dir)
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

/// Outbound handle onto the event bus and message broker
#[derive(Clone)]
pub struct PluginTransport {
    plugin_id: String,
    bus: EventBus,
    broker: MessageBroker,
}

impl PluginTransport {
    pub fn new(plugin_id: impl Into<String>, bus: EventBus, broker: MessageBroker) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
            broker,
        }
    }

    /// Build an event sourced from this plugin.
    pub fn event(&self, event_type: impl Into<String>, payload: serde_json::Value) -> Event {
        Event::new(event_type, self.plugin_id.clone(), payload)
    }

    /// Publish and wait for every subscriber. Returns the number of
    /// subscribers reached.
    pub async fn publish(&self, mut event: Event) -> PluginResult<usize> {
        event.source.clone_from(&self.plugin_id);
        debug!(plugin_id = %self.plugin_id, event_type = %event.event_type, "Plugin publishing event");
        Ok(self.bus.publish(event).await?)
    }

    pub fn publish_async(&self, mut event: Event) -> PluginResult<()> {
        event.source.clone_from(&self.plugin_id);
        Ok(self.bus.publish_async(event)?)
    }

    pub async fn send(
        &self,
        to: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> PluginResult<()> {
        let message = Message::new(message_type, self.plugin_id.clone(), to, payload);
        Ok(self.broker.send_message(message).await?)
    }

    pub async fn request(
        &self,
        to: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> PluginResult<Message> {
        let message = Message::new(message_type, self.plugin_id.clone(), to, payload);
        Ok(self.broker.send_request(message, timeout).await?)
    }

    /// Answer `message_type` messages on behalf of this plugin. Returns
    /// `true` when a previous handler was replaced.
    pub async fn serve(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> PluginResult<bool> {
        let message_type = message_type.into();
        debug!(plugin_id = %self.plugin_id, message_type = %message_type, "Plugin serving message type");
        Ok(self.broker.register_handler(message_type, handler).await?)
    }

    pub async fn withdraw(&self, message_type: &str) -> bool {
        self.broker.unregister_handler(message_type).await
    }
}
