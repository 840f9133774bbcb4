//! Plugin runtime environment
//!
//! Wires the communication hub, audit trail, security manager, registry and
//! lifecycle manager together and exposes the operations offered to the
//! host process.

use std::sync::Arc;
use std::time::Duration;

use audit_engine::AuditTrail;
use events_bus::{Event, EventBus, EventHandler, Message, MessageBroker, MessageHandler, SubscriptionId};
use tracing::info;
use uuid::Uuid;

use crate::api::{HttpRequest, HttpResponse, Plugin, PluginConfig};
use crate::config::RuntimeConfig;
use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::health::HealthReport;
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::permission::Permission;
use crate::registry::{PluginFilter, PluginInfo, PluginRegistry, RegistryWatcher, WatchId};
use crate::security::{SecurityManager, SecurityPolicy};
use crate::storage::SnapshotStore;

/// Plugin runtime environment
pub struct PluginRuntime {
    id: Uuid,
    config: RuntimeConfig,
    bus: EventBus,
    broker: MessageBroker,
    audit: Arc<AuditTrail>,
    security: Arc<SecurityManager>,
    registry: Arc<PluginRegistry>,
    lifecycle: LifecycleManager,
}

impl PluginRuntime {
    /// Build a runtime. Must be called inside a Tokio runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        let bus = EventBus::new(config.event_bus.clone());
        let broker = MessageBroker::new(config.broker.clone());
        let audit = Arc::new(AuditTrail::new(config.audit.clone()));
        let security = Arc::new(SecurityManager::new(config.security.clone(), audit.clone()));
        let registry = Arc::new(PluginRegistry::new(config.registry.clone()));
        let lifecycle = LifecycleManager::new(
            config.lifecycle.clone(),
            config.health.clone(),
            Arc::clone(&registry),
            Arc::clone(&security),
            bus.clone(),
            broker.clone(),
        );

        let id = Uuid::new_v4();
        info!(runtime_id = %id, "Plugin runtime created");
        Self {
            id,
            config,
            bus,
            broker,
            audit,
            security,
            registry,
            lifecycle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    // Lifecycle

    pub async fn register_plugin(&self, descriptor: PluginDescriptor, instance: Arc<dyn Plugin>) -> PluginResult<()> {
        self.lifecycle.register_plugin(descriptor, instance).await
    }

    pub async fn initialize(&self, plugin_id: &str, config: PluginConfig) -> PluginResult<()> {
        self.lifecycle.initialize(plugin_id, config).await
    }

    pub async fn start(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.start(plugin_id).await
    }

    pub async fn stop(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.stop(plugin_id).await
    }

    pub async fn restart(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.restart(plugin_id).await
    }

    pub async fn unregister(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.unregister(plugin_id).await
    }

    pub async fn get_state(&self, plugin_id: &str) -> PluginResult<LifecycleState> {
        self.lifecycle.get_state(plugin_id).await
    }

    pub async fn get_health(&self, plugin_id: &str) -> PluginResult<Option<HealthReport>> {
        self.lifecycle.get_health(plugin_id).await
    }

    pub async fn update_config(&self, plugin_id: &str, config: PluginConfig) -> PluginResult<()> {
        self.lifecycle.update_config(plugin_id, config).await
    }

    pub async fn process_data(&self, plugin_id: &str, input: serde_json::Value) -> PluginResult<serde_json::Value> {
        self.lifecycle.process_data(plugin_id, input).await
    }

    pub async fn handle_http(&self, plugin_id: &str, request: HttpRequest) -> PluginResult<HttpResponse> {
        self.lifecycle.handle_http(plugin_id, request).await
    }

    // Registry

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        self.registry.list_plugins().await
    }

    pub async fn find_plugins(&self, filter: &PluginFilter) -> Vec<PluginInfo> {
        self.registry.find_plugins(filter).await
    }

    pub async fn get_plugin_info(&self, plugin_id: &str) -> PluginResult<PluginInfo> {
        self.registry.get_plugin_info(plugin_id).await
    }

    pub fn watch(&self, watcher: Arc<dyn RegistryWatcher>) -> WatchId {
        self.registry.watch(watcher)
    }

    pub async fn save_registry(&self, store: &dyn SnapshotStore) -> PluginResult<()> {
        self.registry.save_registry(store).await
    }

    /// Restore registry records from a snapshot. Restored plugins carry no
    /// instance; they must be registered again before they can run.
    pub async fn load_registry(&self, store: &dyn SnapshotStore) -> PluginResult<usize> {
        self.registry.load_registry(store).await
    }

    // Communication

    pub async fn publish(&self, event: Event) -> PluginResult<usize> {
        Ok(self.bus.publish(event).await?)
    }

    pub fn publish_async(&self, event: Event) -> PluginResult<()> {
        Ok(self.bus.publish_async(event)?)
    }

    pub async fn subscribe(
        &self,
        event_type: &str,
        subscriber: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.bus.subscribe(event_type, subscriber, handler).await
    }

    pub async fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>) -> PluginResult<bool> {
        Ok(self.broker.register_handler(message_type, handler).await?)
    }

    pub async fn send_message(&self, message: Message) -> PluginResult<()> {
        Ok(self.broker.send_message(message).await?)
    }

    /// Send a request and wait for its reply; `None` uses the broker's
    /// default timeout.
    pub async fn send_request(&self, request: Message, timeout: Option<Duration>) -> PluginResult<Message> {
        let timeout = timeout.unwrap_or_else(|| self.broker.config().default_request_timeout());
        Ok(self.broker.send_request(request, timeout).await?)
    }

    // Security

    pub async fn grant_permission(&self, plugin_id: &str, permission: Permission, actor: Option<&str>) -> PluginResult<bool> {
        self.ensure_known(plugin_id).await?;
        self.security.grant_permission(plugin_id, permission, actor)
    }

    pub async fn revoke_permission(&self, plugin_id: &str, permission: &Permission, actor: Option<&str>) -> PluginResult<bool> {
        self.ensure_known(plugin_id).await?;
        Ok(self.security.revoke_permission(plugin_id, permission, actor))
    }

    pub fn check_permission(&self, plugin_id: &str, requested: &Permission) -> PluginResult<()> {
        self.security.check_permission(plugin_id, requested)
    }

    pub async fn apply_security_policy(
        &self,
        plugin_id: &str,
        policy: SecurityPolicy,
        actor: Option<&str>,
    ) -> PluginResult<()> {
        self.ensure_known(plugin_id).await?;
        self.security.apply_security_policy(plugin_id, policy, actor)
    }

    pub fn get_permissions(&self, plugin_id: &str) -> Vec<Permission> {
        self.security.get_permissions(plugin_id)
    }

    /// Stop every started plugin, then drain and close the event bus.
    pub async fn shutdown(&self) {
        let stopped = self.lifecycle.stop_all().await;
        self.bus.close().await;
        info!(runtime_id = %self.id, stopped, "Plugin runtime shut down");
    }

    async fn ensure_known(&self, plugin_id: &str) -> PluginResult<()> {
        if self.registry.contains(plugin_id).await {
            Ok(())
        } else {
            Err(PluginRuntimeError::PluginNotFound(plugin_id.to_string()))
        }
    }
}

impl Default for PluginRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
