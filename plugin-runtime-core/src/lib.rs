//! Plugin hosting runtime
//!
//! Hosts in-process plugins behind a small trait surface and manages them
//! through a strict lifecycle:
//!
//! - Lifecycle management (register, initialize, start, stop, restart,
//!   unregister) with every transition checked against a fixed table
//! - A registry of descriptors and states with filtering, watchers and
//!   snapshot persistence
//! - Capability wiring: event subscriptions, scheduled jobs, data
//!   processing, HTTP routing and live reconfiguration
//! - Capability-based security with wildcard permissions, resource
//!   restrictions and an audited decision trail
//! - Inter-plugin communication through the event bus and message broker
//! - Periodic health checks with failure thresholds
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use plugin_runtime_core::{
//!     async_trait, LifecycleState, Plugin, PluginContext, PluginDescriptor, PluginResult,
//!     PluginRuntime,
//! };
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Plugin for Hello {
//!     async fn initialize(&self, _ctx: &PluginContext) -> PluginResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = std::env::temp_dir().join("plugin-runtime-doc");
//!     let mut config = plugin_runtime_core::RuntimeConfig::default();
//!     config.lifecycle.data_root = dir.join("data");
//!     config.lifecycle.temp_root = dir.join("tmp");
//!
//!     let runtime = PluginRuntime::new(config);
//!     runtime
//!         .register_plugin(PluginDescriptor::new("hello", "Hello", "1.0.0"), Arc::new(Hello))
//!         .await?;
//!     runtime.initialize("hello", Default::default()).await?;
//!     runtime.start("hello").await?;
//!     assert_eq!(runtime.get_state("hello").await?, LifecycleState::Started);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod loader;
pub mod permission;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod storage;
pub mod task;

pub use api::{
    CapabilityHandle, ConfigField, ConfigurableCapability, DataCapability, EventCapability, HealthCheck,
    HealthLevel, HealthStatus, HttpCapability, HttpRequest, HttpResponse, HttpRoute, Plugin, PluginConfig,
    ScheduledCapability,
};
pub use config::RuntimeConfig;
pub use context::{PluginContext, PluginTransport};
pub use descriptor::{Capability, PluginDependency, PluginDescriptor};
pub use error::{ErrorCategory, PluginResult, PluginRuntimeError};
pub use health::{HealthConfig, HealthReport};
pub use lifecycle::{LifecycleConfig, LifecycleManager, LifecycleState, StateChange, LIFECYCLE_EVENT};
pub use loader::{load_descriptor, parse_descriptor, ManifestFormat};
pub use permission::{Permission, PermissionLevel, PermissionType};
pub use registry::{PluginFilter, PluginInfo, PluginRegistry, RegistryConfig, RegistryEvent, RegistryWatcher, WatchId};
pub use runtime::PluginRuntime;
pub use security::{
    validate_descriptor, ResourceRestrictions, SandboxParameters, SecurityConfig, SecurityContext, SecurityManager,
    SecurityPolicy,
};
pub use storage::{InMemorySnapshotStore, JsonFileSnapshotStore, RegistrySnapshot, SnapshotStore};

pub use async_trait::async_trait;
pub use events_bus::{Event, Message};
