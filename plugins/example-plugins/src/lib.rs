//! Sample plugins for the plugin host
//!
//! - [`EchoPlugin`]: HTTP, data, event and request/reply reflection
//! - [`HeartbeatPlugin`]: scheduled liveness events with a health check
//!
//! [`builtin`] hands both to a host ready for registration.

pub mod echo;
pub mod heartbeat;

use std::sync::Arc;

use plugin_runtime_core::{Plugin, PluginDescriptor};

pub use echo::EchoPlugin;
pub use heartbeat::HeartbeatPlugin;

/// Every bundled plugin with its descriptor
pub fn builtin() -> Vec<(PluginDescriptor, Arc<dyn Plugin>)> {
    vec![
        (EchoPlugin::descriptor(), Arc::new(EchoPlugin::new()) as Arc<dyn Plugin>),
        (HeartbeatPlugin::descriptor(), Arc::new(HeartbeatPlugin::new()) as Arc<dyn Plugin>),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_runtime_core::{load_descriptor, SecurityConfig};

    #[test]
    fn test_builtin_descriptors_are_valid() {
        for (descriptor, plugin) in builtin() {
            plugin_runtime_core::validate_descriptor(&descriptor, &SecurityConfig::default()).unwrap();
            for capability in &descriptor.capabilities {
                assert!(plugin.capability(*capability).is_some(), "{descriptor} lacks {capability}");
            }
        }
    }

    #[tokio::test]
    async fn test_shipped_manifests_match_descriptors() {
        let manifests = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("manifests");
        assert_eq!(
            load_descriptor(manifests.join("echo.toml")).await.unwrap(),
            EchoPlugin::descriptor()
        );
        assert_eq!(
            load_descriptor(manifests.join("heartbeat.yaml")).await.unwrap(),
            HeartbeatPlugin::descriptor()
        );
    }
}
