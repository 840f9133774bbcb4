//! Plugin lifecycle management
//!
//! Owns plugin instances and drives them through the lifecycle table:
//!
//! ```text
//! Unloaded -> Loaded -> Initialized -> Starting -> Started
//!                                          ^           |
//!                                          |       Stopping
//!                                          |           v
//!                                          +------- Stopped -> Unloaded
//! ```
//!
//! `Error` is reachable from every failed transition and only leads to
//! `Unloaded`. Any pair outside the table is rejected with
//! `InvalidStateTransition` and leaves the state untouched.
//!
//! Lifecycle operations on one plugin are serialized by a per-plugin lock;
//! plugin code (hooks, capabilities) always runs in its own task, outside the
//! catalog locks, bounded by the configured operation timeout. A lifecycle
//! call whose future is dropped midway aborts the running hook and leaves the
//! plugin in `Error`, so it can still be unregistered.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use events_bus::{Event, EventBus, EventBusError, EventHandler, MessageBroker, SubscriptionId};

use crate::api::{HttpRequest, HttpResponse, Plugin, PluginConfig};
use crate::context::{PluginContext, PluginTransport};
use crate::descriptor::{Capability, PluginDescriptor};
use crate::error::{PluginResult, PluginRuntimeError};
use crate::health::{HealthChecker, HealthConfig, HealthReport};
use crate::registry::PluginRegistry;
use crate::security::SecurityManager;
use crate::task::{AbortOnDrop, BackgroundTask};

/// Event type published for every state change
pub const LIFECYCLE_EVENT: &str = "plugin.lifecycle";

const LIFECYCLE_SOURCE: &str = "lifecycle-manager";

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Unloaded,
        LifecycleState::Loaded,
        LifecycleState::Initialized,
        LifecycleState::Starting,
        LifecycleState::Started,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Error,
    ];

    /// Whether `self -> to` is listed in the lifecycle table.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Unloaded, Loaded)
                | (Loaded, Initialized | Error | Unloaded)
                | (Initialized, Starting | Error | Unloaded)
                | (Starting, Started | Error)
                | (Started, Stopping | Error)
                | (Stopping, Stopped | Error)
                | (Stopped, Starting | Unloaded | Error)
                | (Error, Unloaded)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
}

/// Current state plus a bounded transition history
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: LifecycleState,
    history: VecDeque<StateChange>,
    history_limit: usize,
}

impl StateMachine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: LifecycleState::Unloaded,
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn history(&self) -> impl Iterator<Item = &StateChange> {
        self.history.iter()
    }

    pub fn ensure(&self, plugin_id: &str, to: LifecycleState) -> PluginResult<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(PluginRuntimeError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: self.state,
                to,
            })
        }
    }

    pub fn transition(&mut self, plugin_id: &str, to: LifecycleState) -> PluginResult<StateChange> {
        self.ensure(plugin_id, to)?;
        let change = StateChange {
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.history.push_back(change.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Ok(change)
    }
}

/// Plugin lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Maximum number of managed plugins
    pub max_plugins: usize,
    /// Deadline for every hook invocation
    pub operation_timeout_ms: u64,
    /// Pause between stop and start on restart
    pub restart_delay_ms: u64,
    /// Transitions remembered per plugin
    pub history_limit: usize,
    /// Grant a descriptor's requested permissions at initialize
    pub auto_grant_requested_permissions: bool,
    /// Root of per-plugin data directories
    pub data_root: PathBuf,
    /// Root of per-plugin temp directories, removed on unregister
    pub temp_root: PathBuf,
}

impl LifecycleConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_plugins: 64,
            operation_timeout_ms: 30_000,
            restart_delay_ms: 1_000,
            history_limit: 32,
            auto_grant_requested_permissions: false,
            data_root: PathBuf::from("./data/plugins"),
            temp_root: std::env::temp_dir().join("plugin-host"),
        }
    }
}

/// Mutable per-plugin runtime bits, guarded by the per-plugin ops lock
#[derive(Default)]
struct Attachments {
    context: Option<PluginContext>,
    subscriptions: Vec<(String, SubscriptionId)>,
    schedule: Option<BackgroundTask>,
}

struct ManagedPlugin {
    descriptor: PluginDescriptor,
    instance: Arc<dyn Plugin>,
    machine: parking_lot::RwLock<StateMachine>,
    health: parking_lot::RwLock<Option<Arc<HealthChecker>>>,
    ops: Mutex<Attachments>,
}

impl ManagedPlugin {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn state(&self) -> LifecycleState {
        self.machine.read().state()
    }

    fn health_checker(&self) -> Option<Arc<HealthChecker>> {
        self.health.read().clone()
    }
}

/// Plugin lifecycle manager
pub struct LifecycleManager {
    plugins: RwLock<HashMap<String, Arc<ManagedPlugin>>>,
    registry: Arc<PluginRegistry>,
    security: Arc<SecurityManager>,
    bus: EventBus,
    broker: MessageBroker,
    config: LifecycleConfig,
    health_config: HealthConfig,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        health_config: HealthConfig,
        registry: Arc<PluginRegistry>,
        security: Arc<SecurityManager>,
        bus: EventBus,
        broker: MessageBroker,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            registry,
            security,
            bus,
            broker,
            config,
            health_config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Take ownership of `instance` and catalog it at `Loaded`.
    pub async fn register_plugin(&self, descriptor: PluginDescriptor, instance: Arc<dyn Plugin>) -> PluginResult<()> {
        self.security.validate_plugin(&descriptor)?;
        for capability in &descriptor.capabilities {
            if instance.capability(*capability).is_none() {
                return Err(PluginRuntimeError::InvalidManifest(format!(
                    "plugin {} declares the {capability} capability but does not provide it",
                    descriptor.id
                )));
            }
        }

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&descriptor.id) {
            return Err(PluginRuntimeError::PluginAlreadyExists(descriptor.id));
        }
        if plugins.len() >= self.config.max_plugins {
            return Err(PluginRuntimeError::ResourceExceeded(format!(
                "maximum of {} managed plugins reached",
                self.config.max_plugins
            )));
        }

        self.registry.register(descriptor.clone(), LifecycleState::Loaded).await?;

        let mut machine = StateMachine::new(self.config.history_limit);
        let change = machine.transition(&descriptor.id, LifecycleState::Loaded)?;
        let plugin_id = descriptor.id.clone();
        plugins.insert(
            plugin_id.clone(),
            Arc::new(ManagedPlugin {
                descriptor,
                instance,
                machine: parking_lot::RwLock::new(machine),
                health: parking_lot::RwLock::new(None),
                ops: Mutex::new(Attachments::default()),
            }),
        );
        drop(plugins);

        self.announce(&plugin_id, &change);
        Ok(())
    }

    /// Bind a context and run the plugin's initialize hook.
    pub async fn initialize(&self, plugin_id: &str, config: PluginConfig) -> PluginResult<()> {
        let plugin = self.get(plugin_id).await?;
        let mut attachments = plugin.ops.lock().await;
        plugin.machine.read().ensure(plugin_id, LifecycleState::Initialized)?;

        self.check_dependencies(&plugin.descriptor).await?;

        let in_flight = InFlight::new(self, &plugin, LifecycleState::Loaded);
        let result = self.initialize_locked(&plugin, &mut attachments, config).await;
        in_flight.finish();
        result
    }

    async fn initialize_locked(
        &self,
        plugin: &Arc<ManagedPlugin>,
        attachments: &mut Attachments,
        config: PluginConfig,
    ) -> PluginResult<()> {
        let plugin_id = plugin.id();
        if let Err(source) = check_required_keys(plugin.instance.as_ref(), &config) {
            return Err(self.fail_initialize(plugin, source).await);
        }

        let data_dir = self.config.data_root.join(plugin_id);
        let temp_dir = self.config.temp_root.join(plugin_id);
        for dir in [&data_dir, &temp_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return Err(self.fail_initialize(plugin, e.into()).await);
            }
        }

        let transport = PluginTransport::new(plugin_id, self.bus.clone(), self.broker.clone());
        let context = PluginContext::new(plugin_id, config, data_dir, temp_dir, transport);

        let instance = Arc::clone(&plugin.instance);
        let hook_ctx = context.clone();
        let outcome = run_hook(plugin_id, "initialize", self.config.operation_timeout(), async move {
            instance.initialize(&hook_ctx).await
        })
        .await;
        if let Err(source) = outcome {
            return Err(self.fail_initialize(plugin, source).await);
        }

        if self.config.auto_grant_requested_permissions {
            for permission in &plugin.descriptor.permissions {
                self.security
                    .grant_permission(plugin_id, permission.clone(), Some(LIFECYCLE_SOURCE))?;
            }
        }
        self.security.create_security_context(plugin_id);
        attachments.context = Some(context);

        if plugin.instance.supports_health_check() {
            *plugin.health.write() = Some(Arc::new(HealthChecker::new(
                plugin_id,
                Arc::clone(&plugin.instance),
                self.health_config.clone(),
            )));
        }

        self.set_state(plugin, LifecycleState::Initialized).await?;
        Ok(())
    }

    /// Start an initialized or stopped plugin.
    pub async fn start(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self.get(plugin_id).await?;
        let mut attachments = plugin.ops.lock().await;
        let in_flight = InFlight::new(self, &plugin, LifecycleState::Starting);
        let result = self.start_locked(&plugin, &mut attachments).await;
        in_flight.finish();
        result
    }

    async fn start_locked(&self, plugin: &Arc<ManagedPlugin>, attachments: &mut Attachments) -> PluginResult<()> {
        let plugin_id = plugin.id();
        self.set_state(plugin, LifecycleState::Starting).await?;

        let instance = Arc::clone(&plugin.instance);
        let outcome = run_hook(plugin_id, "start", self.config.operation_timeout(), async move {
            instance.start().await
        })
        .await;
        if let Err(source) = outcome {
            error!(plugin_id = %plugin_id, error = %source, "Plugin start failed");
            self.set_state(plugin, LifecycleState::Error).await?;
            return Err(PluginRuntimeError::StartFailed {
                plugin_id: plugin_id.to_string(),
                source: Box::new(source),
            });
        }

        self.attach(plugin, attachments).await;
        if let Some(health) = plugin.health_checker() {
            health.start();
        }

        self.set_state(plugin, LifecycleState::Started).await?;
        Ok(())
    }

    /// Stop a started plugin. Background tasks are stopped and awaited
    /// before the plugin's stop hook runs.
    pub async fn stop(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self.get(plugin_id).await?;
        let mut attachments = plugin.ops.lock().await;
        self.stop_locked(&plugin, &mut attachments).await
    }

    /// Stop, wait the configured delay, then start again.
    pub async fn restart(&self, plugin_id: &str) -> PluginResult<()> {
        self.stop(plugin_id).await?;
        tokio::time::sleep(self.config.restart_delay()).await;
        self.start(plugin_id).await
    }

    /// Force-stop if running, run cleanup, and forget everything tracked for
    /// the plugin.
    pub async fn unregister(&self, plugin_id: &str) -> PluginResult<()> {
        let live = self.plugins.read().await.get(plugin_id).cloned();
        let Some(plugin) = live else {
            return self.forget_catalog_entry(plugin_id).await;
        };
        let mut attachments = plugin.ops.lock().await;

        if plugin.state() == LifecycleState::Started {
            if let Err(e) = self.stop_locked(&plugin, &mut attachments).await {
                warn!(plugin_id = %plugin_id, error = %e, "Forced stop failed during unregister");
            }
        }
        self.detach(&plugin, &mut attachments).await;

        let instance = Arc::clone(&plugin.instance);
        if let Err(e) = run_hook(plugin_id, "cleanup", self.config.operation_timeout(), async move {
            instance.cleanup().await
        })
        .await
        {
            warn!(plugin_id = %plugin_id, error = %e, "Plugin cleanup failed");
        }

        if plugin.state() != LifecycleState::Unloaded {
            self.set_state(&plugin, LifecycleState::Unloaded).await?;
        }

        if let Some(context) = attachments.context.take() {
            match tokio::fs::remove_dir_all(context.temp_dir()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Failed to remove temp directory"),
            }
        }
        plugin.health.write().take();

        self.plugins.write().await.remove(plugin_id);
        if let Err(e) = self.registry.unregister(plugin_id).await {
            debug!(plugin_id = %plugin_id, error = %e, "Plugin was not catalogued");
        }
        self.security.remove_plugin(plugin_id);

        info!(plugin_id = %plugin_id, "Plugin unregistered");
        Ok(())
    }

    /// Replace the configuration snapshot of a configurable plugin.
    pub async fn update_config(&self, plugin_id: &str, config: PluginConfig) -> PluginResult<()> {
        let plugin = self.get(plugin_id).await?;
        let mut attachments = plugin.ops.lock().await;

        let state = plugin.state();
        if !matches!(
            state,
            LifecycleState::Initialized | LifecycleState::Started | LifecycleState::Stopped
        ) {
            return Err(PluginRuntimeError::PluginNotRunning {
                plugin_id: plugin_id.to_string(),
                state,
            });
        }
        if plugin.instance.configurable().is_none() {
            return Err(PluginRuntimeError::CapabilityUnavailable {
                plugin_id: plugin_id.to_string(),
                capability: Capability::Configurable,
            });
        }
        check_required_keys(plugin.instance.as_ref(), &config)?;

        let instance = Arc::clone(&plugin.instance);
        let hook_config = config.clone();
        run_hook(plugin_id, "on_config_changed", self.config.operation_timeout(), async move {
            match instance.configurable() {
                Some(configurable) => configurable.on_config_changed(&hook_config).await,
                None => Ok(()),
            }
        })
        .await?;

        if let Some(context) = attachments.context.as_mut() {
            context.replace_config(config);
        }
        info!(plugin_id = %plugin_id, "Plugin configuration updated");
        Ok(())
    }

    /// Run the data capability of a started plugin.
    pub async fn process_data(&self, plugin_id: &str, input: serde_json::Value) -> PluginResult<serde_json::Value> {
        let plugin = self.running(plugin_id, Capability::Data).await?;
        let instance = Arc::clone(&plugin.instance);
        let id = plugin_id.to_string();
        run_hook(plugin_id, "process_data", self.config.operation_timeout(), async move {
            match instance.data() {
                Some(data) => data.process(input).await,
                None => Err(PluginRuntimeError::CapabilityUnavailable {
                    plugin_id: id,
                    capability: Capability::Data,
                }),
            }
        })
        .await
    }

    /// Route an HTTP request to a started plugin.
    pub async fn handle_http(&self, plugin_id: &str, request: HttpRequest) -> PluginResult<HttpResponse> {
        let plugin = self.running(plugin_id, Capability::Http).await?;
        let instance = Arc::clone(&plugin.instance);
        let id = plugin_id.to_string();
        run_hook(plugin_id, "handle_request", self.config.operation_timeout(), async move {
            match instance.http() {
                Some(http) => http.handle_request(request).await,
                None => Err(PluginRuntimeError::CapabilityUnavailable {
                    plugin_id: id,
                    capability: Capability::Http,
                }),
            }
        })
        .await
    }

    /// Drop a registry entry restored from a snapshot that never got an
    /// instance.
    async fn forget_catalog_entry(&self, plugin_id: &str) -> PluginResult<()> {
        let info = self.registry.get_plugin_info(plugin_id).await?;
        if !info.is_catalog_only() {
            return Err(PluginRuntimeError::PluginNotFound(plugin_id.to_string()));
        }
        self.registry.unregister(plugin_id).await?;
        self.security.remove_plugin(plugin_id);
        info!(plugin_id = %plugin_id, "Restored catalog entry removed");
        Ok(())
    }

    pub async fn get_state(&self, plugin_id: &str) -> PluginResult<LifecycleState> {
        Ok(self.get(plugin_id).await?.state())
    }

    /// Latest health report, `None` for plugins without health checks.
    pub async fn get_health(&self, plugin_id: &str) -> PluginResult<Option<HealthReport>> {
        Ok(self.get(plugin_id).await?.health_checker().map(|h| h.report()))
    }

    /// Check a plugin's health immediately.
    pub async fn check_health(&self, plugin_id: &str) -> PluginResult<Option<HealthReport>> {
        match self.get(plugin_id).await?.health_checker() {
            Some(health) => Ok(Some(health.check_now().await)),
            None => Ok(None),
        }
    }

    pub async fn state_history(&self, plugin_id: &str) -> PluginResult<Vec<StateChange>> {
        let plugin = self.get(plugin_id).await?;
        let history = plugin.machine.read().history().cloned().collect();
        Ok(history)
    }

    pub async fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every started plugin. Failures are logged and do not prevent
    /// the remaining plugins from stopping.
    pub async fn stop_all(&self) -> usize {
        let plugins: Vec<Arc<ManagedPlugin>> = self.plugins.read().await.values().cloned().collect();
        let mut stopped = 0usize;
        for plugin in plugins {
            if plugin.state() != LifecycleState::Started {
                continue;
            }
            match self.stop(plugin.id()).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(plugin_id = %plugin.id(), error = %e, "Failed to stop plugin during shutdown"),
            }
        }
        stopped
    }

    async fn get(&self, plugin_id: &str) -> PluginResult<Arc<ManagedPlugin>> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))
    }

    async fn running(&self, plugin_id: &str, capability: Capability) -> PluginResult<Arc<ManagedPlugin>> {
        let plugin = self.get(plugin_id).await?;
        let state = plugin.state();
        if state != LifecycleState::Started {
            return Err(PluginRuntimeError::PluginNotRunning {
                plugin_id: plugin_id.to_string(),
                state,
            });
        }
        if plugin.instance.capability(capability).is_none() {
            return Err(PluginRuntimeError::CapabilityUnavailable {
                plugin_id: plugin_id.to_string(),
                capability,
            });
        }
        Ok(plugin)
    }

    async fn check_dependencies(&self, descriptor: &PluginDescriptor) -> PluginResult<()> {
        for dependency in &descriptor.dependencies {
            let missing = |requirement: String| PluginRuntimeError::DependencyMissing {
                plugin_id: descriptor.id.clone(),
                dependency: dependency.id.clone(),
                requirement,
            };

            let info = self
                .registry
                .get_plugin_info(&dependency.id)
                .await
                .ok()
                .filter(|info| !info.is_catalog_only())
                .ok_or_else(|| missing(format!("{} (not registered)", dependency.version_req)))?;
            let requirement = dependency.requirement()?;
            let version = info.descriptor.semver()?;
            if !requirement.matches(&version) {
                return Err(missing(format!("{} (found {version})", dependency.version_req)));
            }
        }
        Ok(())
    }

    async fn fail_initialize(&self, plugin: &ManagedPlugin, source: PluginRuntimeError) -> PluginRuntimeError {
        error!(plugin_id = %plugin.id(), error = %source, category = %source.category(), "Plugin initialization failed");
        if let Err(e) = self.set_state(plugin, LifecycleState::Error).await {
            warn!(plugin_id = %plugin.id(), error = %e, "Could not record error state");
        }
        PluginRuntimeError::InitializationFailed {
            plugin_id: plugin.id().to_string(),
            source: Box::new(source),
        }
    }

    async fn stop_locked(&self, plugin: &Arc<ManagedPlugin>, attachments: &mut Attachments) -> PluginResult<()> {
        let in_flight = InFlight::new(self, plugin, LifecycleState::Stopping);
        let result = self.stop_hooked(plugin, attachments).await;
        in_flight.finish();
        result
    }

    async fn stop_hooked(&self, plugin: &ManagedPlugin, attachments: &mut Attachments) -> PluginResult<()> {
        self.set_state(plugin, LifecycleState::Stopping).await?;
        self.detach(plugin, attachments).await;

        let instance = Arc::clone(&plugin.instance);
        let outcome = run_hook(plugin.id(), "stop", self.config.operation_timeout(), async move {
            instance.stop().await
        })
        .await;
        if let Err(source) = outcome {
            error!(plugin_id = %plugin.id(), error = %source, "Plugin stop failed");
            self.set_state(plugin, LifecycleState::Error).await?;
            return Err(PluginRuntimeError::StopFailed {
                plugin_id: plugin.id().to_string(),
                source: Box::new(source),
            });
        }

        self.set_state(plugin, LifecycleState::Stopped).await?;
        Ok(())
    }

    /// Subscribe declared event types and spawn the schedule task.
    async fn attach(&self, plugin: &ManagedPlugin, attachments: &mut Attachments) {
        if let Some(events) = plugin.instance.events() {
            let handler: Arc<dyn EventHandler> = Arc::new(PluginEventHandler {
                plugin: Arc::clone(&plugin.instance),
            });
            for event_type in events.subscriptions() {
                let id = self.bus.subscribe(event_type.clone(), plugin.id(), Arc::clone(&handler)).await;
                attachments.subscriptions.push((event_type, id));
            }
        }

        if let Some(scheduled) = plugin.instance.scheduled() {
            let instance = Arc::clone(&plugin.instance);
            let plugin_id = plugin.id().to_string();
            let timeout = self.config.operation_timeout();
            attachments.schedule = Some(BackgroundTask::spawn_interval(
                format!("schedule:{plugin_id}"),
                scheduled.interval(),
                move || {
                    let instance = Arc::clone(&instance);
                    let plugin_id = plugin_id.clone();
                    async move {
                        let outcome = run_hook(&plugin_id, "run_scheduled", timeout, async move {
                            match instance.scheduled() {
                                Some(scheduled) => scheduled.run_scheduled().await,
                                None => Ok(()),
                            }
                        })
                        .await;
                        if let Err(e) = outcome {
                            warn!(plugin_id = %plugin_id, error = %e, "Scheduled run failed");
                        }
                    }
                },
            ));
        }
    }

    /// Tear down every background attachment and wait for it to finish.
    async fn detach(&self, plugin: &ManagedPlugin, attachments: &mut Attachments) {
        if let Some(health) = plugin.health_checker() {
            health.stop().await;
        }
        if let Some(task) = attachments.schedule.take() {
            task.stop().await;
        }
        for (event_type, id) in attachments.subscriptions.drain(..) {
            self.bus.unsubscribe(&event_type, id).await;
        }
    }

    async fn set_state(&self, plugin: &ManagedPlugin, to: LifecycleState) -> PluginResult<StateChange> {
        let change = plugin.machine.write().transition(plugin.id(), to)?;

        if let Err(e) = self.registry.update_state(plugin.id(), to).await {
            debug!(plugin_id = %plugin.id(), error = %e, "State not mirrored to registry");
        }
        self.announce(plugin.id(), &change);
        Ok(change)
    }

    fn announce(&self, plugin_id: &str, change: &StateChange) {
        info!(plugin_id = %plugin_id, from = %change.from, to = %change.to, "Plugin state changed");

        let event = Event::new(
            LIFECYCLE_EVENT,
            LIFECYCLE_SOURCE,
            serde_json::json!({
                "plugin_id": plugin_id,
                "from": change.from,
                "to": change.to,
                "at": change.at,
            }),
        );
        match self.bus.publish_async(event) {
            Ok(()) => {}
            Err(EventBusError::Closed) => debug!(plugin_id = %plugin_id, "Bus closed; lifecycle event dropped"),
            Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Lifecycle event dropped"),
        }
    }
}

/// Armed for the duration of one lifecycle operation. Dropped without
/// [`InFlight::finish`] means the caller abandoned the operation: a plugin
/// still in `pending` is moved to `Error`, and the registry is brought back
/// in line with the state machine.
struct InFlight<'a> {
    manager: &'a LifecycleManager,
    plugin: &'a Arc<ManagedPlugin>,
    pending: LifecycleState,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn new(manager: &'a LifecycleManager, plugin: &'a Arc<ManagedPlugin>, pending: LifecycleState) -> Self {
        Self {
            manager,
            plugin,
            pending,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let plugin = Arc::clone(self.plugin);

        let abandoned = if plugin.state() == self.pending {
            plugin.machine.write().transition(plugin.id(), LifecycleState::Error).ok()
        } else {
            None
        };
        if let Some(change) = &abandoned {
            warn!(plugin_id = %plugin.id(), pending = %self.pending, "Lifecycle operation cancelled");
            self.manager.announce(plugin.id(), change);
        }

        // The per-plugin lock is still held by the cancelled operation; the
        // mirror runs once it is released.
        let registry = Arc::clone(&self.manager.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ops = plugin.ops.lock().await;
                    let state = plugin.state();
                    if let Err(e) = registry.update_state(plugin.id(), state).await {
                        debug!(plugin_id = %plugin.id(), error = %e, "State not mirrored to registry");
                    }
                });
            }
            Err(_) => debug!(plugin_id = %plugin.id(), "No runtime to mirror cancelled state"),
        }
    }
}

/// Forwards bus events to a plugin's event capability
struct PluginEventHandler {
    plugin: Arc<dyn Plugin>,
}

#[async_trait]
impl EventHandler for PluginEventHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match self.plugin.events() {
            Some(events) => events.on_event(event).await.map_err(anyhow::Error::from),
            None => Ok(()),
        }
    }
}

fn check_required_keys(plugin: &dyn Plugin, config: &PluginConfig) -> PluginResult<()> {
    let Some(configurable) = plugin.configurable() else {
        return Ok(());
    };
    let missing: Vec<String> = configurable
        .config_schema()
        .into_iter()
        .filter(|field| field.required && !config.contains_key(&field.key))
        .map(|field| field.key)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PluginRuntimeError::Configuration(format!(
            "missing required configuration keys: {}",
            missing.join(", ")
        )))
    }
}

/// Run plugin code in its own task, bounded by `timeout`. A panic is
/// reported as a plugin error; on timeout, or when the caller stops
/// waiting, the task is aborted.
async fn run_hook<T, Fut>(plugin_id: &str, operation: &str, timeout: Duration, hook: Fut) -> PluginResult<T>
where
    T: Send + 'static,
    Fut: Future<Output = PluginResult<T>> + Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(hook));
    match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(PluginRuntimeError::with_context(
            format!("plugin {plugin_id} panicked: {join_error}"),
            operation,
        )),
        Err(_) => {
            warn!(plugin_id = %plugin_id, operation = %operation, timeout_ms = %timeout.as_millis(), "Plugin hook timed out");
            Err(PluginRuntimeError::timeout(operation, timeout))
        }
    }
}
