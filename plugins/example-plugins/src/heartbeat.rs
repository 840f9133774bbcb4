//! Heartbeat plugin
//!
//! Publishes a `heartbeat` event on a configurable interval and reports
//! itself unhealthy once beats stop going out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plugin_runtime_core::{
    Capability, ConfigField, ConfigurableCapability, HealthStatus, Plugin, PluginConfig, PluginContext,
    PluginDescriptor, PluginResult, PluginRuntimeError, PluginTransport, ScheduledCapability,
};
use serde_json::json;
use tracing::{info, warn};

pub const HEARTBEAT_ID: &str = "heartbeat";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

const DEFAULT_INTERVAL_MS: u64 = 1_000;

#[derive(Default)]
struct BeatState {
    transport: Option<PluginTransport>,
    last_beat: Option<DateTime<Utc>>,
}

pub struct HeartbeatPlugin {
    state: RwLock<BeatState>,
    interval_ms: AtomicU64,
    beats: AtomicU64,
}

impl Default for HeartbeatPlugin {
    fn default() -> Self {
        Self {
            state: RwLock::new(BeatState::default()),
            interval_ms: AtomicU64::new(DEFAULT_INTERVAL_MS),
            beats: AtomicU64::new(0),
        }
    }
}

impl HeartbeatPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(HEARTBEAT_ID, "Heartbeat", "1.0.0")
            .with_description("Periodic liveness beacon")
            .with_author("Plugin Host")
            .with_category("monitoring")
            .with_tag("demo")
            .with_capability(Capability::Scheduled)
            .with_capability(Capability::Configurable)
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    fn apply(&self, config: &PluginConfig) -> PluginResult<()> {
        let Some(raw) = config.get("interval_ms") else {
            return Ok(());
        };
        let interval_ms: u64 = raw
            .parse()
            .map_err(|_| PluginRuntimeError::Configuration(format!("interval_ms is not a number: {raw}")))?;
        if interval_ms == 0 {
            return Err(PluginRuntimeError::Configuration("interval_ms must be positive".to_string()));
        }
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Plugin for HeartbeatPlugin {
    async fn initialize(&self, ctx: &PluginContext) -> PluginResult<()> {
        self.apply(ctx.config())?;
        self.state.write().transport = Some(ctx.transport().clone());
        Ok(())
    }

    async fn cleanup(&self) -> PluginResult<()> {
        *self.state.write() = BeatState::default();
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        true
    }

    async fn health_check(&self) -> PluginResult<HealthStatus> {
        let last_beat = self.state.read().last_beat;
        // Three missed intervals count as stalled.
        let allowed = chrono::Duration::milliseconds(
            i64::try_from(self.interval_ms.load(Ordering::Relaxed).saturating_mul(3)).unwrap_or(i64::MAX),
        );
        Ok(match last_beat {
            None => HealthStatus::healthy("no beat sent yet"),
            Some(at) if Utc::now() - at <= allowed => HealthStatus::healthy(format!("last beat at {at}")),
            Some(at) => HealthStatus::unhealthy(format!("beats stalled since {at}")),
        })
    }

    fn scheduled(&self) -> Option<&dyn ScheduledCapability> {
        Some(self)
    }

    fn configurable(&self) -> Option<&dyn ConfigurableCapability> {
        Some(self)
    }
}

#[async_trait]
impl ScheduledCapability for HeartbeatPlugin {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    async fn run_scheduled(&self) -> PluginResult<()> {
        let transport = self
            .state
            .read()
            .transport
            .clone()
            .ok_or_else(|| PluginRuntimeError::with_context("plugin has no context yet", HEARTBEAT_ID))?;

        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        if let Err(e) = transport.publish_async(transport.event(HEARTBEAT_EVENT, json!({ "beat": beat, "at": now }))) {
            warn!(beat, error = %e, "Heartbeat not published");
            return Err(e);
        }
        self.state.write().last_beat = Some(now);
        Ok(())
    }
}

#[async_trait]
impl ConfigurableCapability for HeartbeatPlugin {
    fn config_schema(&self) -> Vec<ConfigField> {
        vec![ConfigField::optional("interval_ms", "Milliseconds between beats")]
    }

    /// A new interval takes effect the next time the plugin starts.
    async fn on_config_changed(&self, config: &PluginConfig) -> PluginResult<()> {
        self.apply(config)?;
        info!(interval_ms = self.interval_ms.load(Ordering::Relaxed), "Heartbeat reconfigured");
        Ok(())
    }
}
