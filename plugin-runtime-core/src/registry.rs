//! Plugin registry
//!
//! Thread-safe catalog of plugin descriptors and their lifecycle states,
//! keyed by plugin id. Reads run concurrently; writes are exclusive.
//! Observers registered with [`PluginRegistry::watch`] are notified
//! asynchronously, each from its own task, so a slow, failing or panicking
//! observer never affects the registry or other observers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::descriptor::{Capability, PluginDescriptor};
use crate::error::{PluginResult, PluginRuntimeError};
use crate::lifecycle::LifecycleState;
use crate::storage::{RegistrySnapshot, SnapshotStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-watcher notification buffer; notifications beyond it are dropped
    pub watcher_buffer: usize,
    /// Where the host persists registry snapshots
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            watcher_buffer: 256,
            snapshot_path: None,
        }
    }
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub descriptor: PluginDescriptor,
    pub state: LifecycleState,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// State recorded in the snapshot this entry was restored from. Set only
    /// on catalog-only entries, which sit at `Unloaded` with no instance.
    #[serde(default)]
    pub last_known_state: Option<LifecycleState>,
}

impl PluginInfo {
    /// Restored from a snapshot and not yet claimed by a live instance.
    pub fn is_catalog_only(&self) -> bool {
        self.last_known_state.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(PluginDescriptor),
    Unregistered(String),
    StateChanged {
        plugin_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl RegistryEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Registered(descriptor) => &descriptor.id,
            Self::Unregistered(id) => id,
            Self::StateChanged { plugin_id, .. } => plugin_id,
        }
    }
}

/// Registry observer
#[async_trait]
pub trait RegistryWatcher: Send + Sync {
    async fn on_change(&self, event: &RegistryEvent) -> anyhow::Result<()>;
}

struct FnWatcher<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RegistryWatcher for FnWatcher<F>
where
    F: Fn(RegistryEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_change(&self, event: &RegistryEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct WatcherSlot {
    sender: mpsc::Sender<RegistryEvent>,
    task: JoinHandle<()>,
}

/// Conjunctive discovery filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct PluginFilter {
    pub name: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub tags: BTreeSet<String>,
    pub capabilities: BTreeSet<Capability>,
    pub state: Option<LifecycleState>,
    pub version_req: Option<semver::VersionReq>,
}

impl PluginFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive substring of the plugin name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Case-insensitive substring of the author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn state(mut self, state: LifecycleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn version_req(mut self, req: &str) -> PluginResult<Self> {
        let req = semver::VersionReq::parse(req)
            .map_err(|e| PluginRuntimeError::Configuration(format!("invalid version range '{req}': {e}")))?;
        self.version_req = Some(req);
        Ok(self)
    }

    pub fn matches(&self, info: &PluginInfo) -> bool {
        let d = &info.descriptor;
        contains_ci(&d.name, self.name.as_deref())
            && self.version.as_ref().map_or(true, |v| &d.version == v)
            && contains_ci(&d.author, self.author.as_deref())
            && self.category.as_ref().map_or(true, |c| &d.category == c)
            && self.tags.is_subset(&d.tags)
            && self.capabilities.is_subset(&d.capabilities)
            && self.state.map_or(true, |s| info.state == s)
            && self.version_req.as_ref().map_or(true, |req| {
                d.semver().map(|v| req.matches(&v)).unwrap_or(false)
            })
    }
}

fn contains_ci(haystack: &str, needle: Option<&str>) -> bool {
    needle.map_or(true, |n| haystack.to_lowercase().contains(&n.to_lowercase()))
}

pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginInfo>>,
    watchers: parking_lot::Mutex<HashMap<WatchId, WatcherSlot>>,
    next_watch_id: AtomicU64,
    config: RegistryConfig,
}

impl PluginRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            watchers: parking_lot::Mutex::new(HashMap::new()),
            next_watch_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add a descriptor. Fails if the id is already catalogued, unless the
    /// existing entry is catalog-only; that entry is then replaced.
    pub async fn register(&self, descriptor: PluginDescriptor, state: LifecycleState) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        match plugins.get(&descriptor.id) {
            Some(existing) if existing.is_catalog_only() => {
                debug!(plugin_id = %descriptor.id, "Adopting restored catalog entry");
            }
            Some(_) => return Err(PluginRuntimeError::PluginAlreadyExists(descriptor.id)),
            None => {}
        }

        let now = Utc::now();
        info!(plugin_id = %descriptor.id, version = %descriptor.version, "Plugin registered");
        plugins.insert(
            descriptor.id.clone(),
            PluginInfo {
                descriptor: descriptor.clone(),
                state,
                registered_at: now,
                updated_at: now,
                last_known_state: None,
            },
        );
        self.notify(RegistryEvent::Registered(descriptor));
        Ok(())
    }

    pub async fn unregister(&self, plugin_id: &str) -> PluginResult<PluginInfo> {
        let mut plugins = self.plugins.write().await;
        let info = plugins
            .remove(plugin_id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))?;

        info!(plugin_id = %plugin_id, "Plugin unregistered");
        self.notify(RegistryEvent::Unregistered(plugin_id.to_string()));
        Ok(info)
    }

    /// Record a new state, returning the previous one.
    pub async fn update_state(&self, plugin_id: &str, state: LifecycleState) -> PluginResult<LifecycleState> {
        let mut plugins = self.plugins.write().await;
        let info = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))?;

        let from = info.state;
        info.state = state;
        info.updated_at = Utc::now();
        if from != state {
            self.notify(RegistryEvent::StateChanged {
                plugin_id: plugin_id.to_string(),
                from,
                to: state,
            });
        }
        Ok(from)
    }

    pub async fn get_plugin_info(&self, plugin_id: &str) -> PluginResult<PluginInfo> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))
    }

    pub async fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.read().await.contains_key(plugin_id)
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    /// Every catalogued plugin, ordered by id.
    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        self.find_plugins(&PluginFilter::default()).await
    }

    pub async fn find_plugins(&self, filter: &PluginFilter) -> Vec<PluginInfo> {
        let mut found: Vec<PluginInfo> = self
            .plugins
            .read()
            .await
            .values()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        found
    }

    /// Register an observer; it receives every subsequent change in order.
    pub fn watch(&self, watcher: Arc<dyn RegistryWatcher>) -> WatchId {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::Relaxed));
        let (sender, mut receiver) = mpsc::channel::<RegistryEvent>(self.config.watcher_buffer.max(1));

        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome = AssertUnwindSafe(watcher.on_change(&event)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        watch_id = id.0,
                        plugin_id = %event.plugin_id(),
                        error = %e,
                        "Registry watcher failed"
                    ),
                    Err(_) => warn!(
                        watch_id = id.0,
                        plugin_id = %event.plugin_id(),
                        "Registry watcher panicked"
                    ),
                }
            }
        });

        self.watchers.lock().insert(id, WatcherSlot { sender, task });
        debug!(watch_id = id.0, "Registry watcher added");
        id
    }

    /// Closure form of [`Self::watch`].
    pub fn watch_fn<F, Fut>(&self, f: F) -> WatchId
    where
        F: Fn(RegistryEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.watch(Arc::new(FnWatcher { f }))
    }

    /// Remove an observer after it has drained its pending notifications.
    pub async fn unwatch(&self, id: WatchId) -> bool {
        let slot = self.watchers.lock().remove(&id);
        match slot {
            Some(WatcherSlot { sender, task }) => {
                drop(sender);
                if let Err(e) = task.await {
                    warn!(watch_id = id.0, error = %e, "Registry watcher task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let plugins = self.plugins.read().await;
        RegistrySnapshot {
            plugins: plugins
                .iter()
                .map(|(id, info)| (id.clone(), info.descriptor.clone()))
                .collect(),
            states: plugins
                .iter()
                .map(|(id, info)| (id.clone(), info.last_known_state.unwrap_or(info.state)))
                .collect(),
            timestamp: Utc::now(),
        }
    }

    pub async fn save_registry(&self, store: &dyn SnapshotStore) -> PluginResult<()> {
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await?;
        info!(plugins = snapshot.plugins.len(), "Registry saved");
        Ok(())
    }

    /// Restore catalogued entries from `store`. Plugins already present are
    /// left untouched. Restored entries have no instance behind them, so they
    /// come back `Unloaded` with the saved state kept as `last_known_state`.
    /// Returns the number of restored entries.
    pub async fn load_registry(&self, store: &dyn SnapshotStore) -> PluginResult<usize> {
        let Some(snapshot) = store.load().await? else {
            debug!("No registry snapshot to load");
            return Ok(0);
        };

        let mut plugins = self.plugins.write().await;
        let mut restored = 0usize;
        for (id, descriptor) in snapshot.plugins {
            if plugins.contains_key(&id) {
                debug!(plugin_id = %id, "Skipping snapshot entry for live plugin");
                continue;
            }
            let saved = snapshot.states.get(&id).copied().unwrap_or(LifecycleState::Unloaded);
            plugins.insert(
                id,
                PluginInfo {
                    descriptor: descriptor.clone(),
                    state: LifecycleState::Unloaded,
                    registered_at: snapshot.timestamp,
                    updated_at: snapshot.timestamp,
                    last_known_state: Some(saved),
                },
            );
            self.notify(RegistryEvent::Registered(descriptor));
            restored += 1;
        }

        info!(restored, snapshot_time = %snapshot.timestamp, "Registry loaded");
        Ok(restored)
    }

    fn notify(&self, event: RegistryEvent) {
        let watchers = self.watchers.lock();
        for (id, slot) in watchers.iter() {
            if let Err(e) = slot.sender.try_send(event.clone()) {
                warn!(watch_id = id.0, error = %e, "Dropping registry notification");
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
