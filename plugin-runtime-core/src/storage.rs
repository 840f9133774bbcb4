//! Durable registry snapshots
//!
//! A snapshot is `{plugins, states, timestamp}`. Stores overwrite the
//! previous snapshot idempotently; plugin instances and their bound
//! contexts are never part of a snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub plugins: BTreeMap<String, PluginDescriptor>,
    pub states: BTreeMap<String, LifecycleState>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &RegistrySnapshot) -> PluginResult<()>;

    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> PluginResult<Option<RegistrySnapshot>>;
}

/// Pretty-printed JSON file, replaced atomically on every save
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn save(&self, snapshot: &RegistrySnapshot) -> PluginResult<()> {
        let contents = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(path = %self.path.display(), plugins = snapshot.plugins.len(), "Registry snapshot saved");
        Ok(())
    }

    async fn load(&self) -> PluginResult<Option<RegistrySnapshot>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&contents).map_err(|e| {
            PluginRuntimeError::Persistence(format!(
                "corrupt registry snapshot {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(snapshot))
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    slot: parking_lot::Mutex<Option<RegistrySnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &RegistrySnapshot) -> PluginResult<()> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> PluginResult<Option<RegistrySnapshot>> {
        Ok(self.slot.lock().clone())
    }
}
