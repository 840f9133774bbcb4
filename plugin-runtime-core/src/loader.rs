//! Plugin descriptor loader
//!
//! Reads a plugin manifest from disk in JSON, YAML or TOML (chosen by file
//! extension) and validates it before handing it to the runtime.

use std::path::Path;
use tracing::debug;

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::security::{validate_descriptor, SecurityConfig};

/// Supported manifest encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Yaml,
    Toml,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> PluginResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => Err(PluginRuntimeError::InvalidManifest(format!(
                "unsupported manifest format: {}",
                path.display()
            ))),
        }
    }
}

/// Parse and validate manifest text.
pub fn parse_descriptor(contents: &str, format: ManifestFormat) -> PluginResult<PluginDescriptor> {
    let descriptor: PluginDescriptor = match format {
        ManifestFormat::Json => serde_json::from_str(contents).map_err(|e| invalid(&e))?,
        ManifestFormat::Yaml => serde_yaml::from_str(contents).map_err(|e| invalid(&e))?,
        ManifestFormat::Toml => toml::from_str(contents).map_err(|e| invalid(&e))?,
    };
    validate_descriptor(&descriptor, &SecurityConfig::default())?;
    Ok(descriptor)
}

/// Read, parse and validate a manifest file.
pub async fn load_descriptor(path: impl AsRef<Path>) -> PluginResult<PluginDescriptor> {
    let path = path.as_ref();
    let format = ManifestFormat::from_path(path)?;
    let contents = tokio::fs::read_to_string(path).await?;
    let descriptor = parse_descriptor(&contents, format)?;
    debug!(path = %path.display(), plugin_id = %descriptor.id, "Loaded plugin descriptor");
    Ok(descriptor)
}

fn invalid(err: &dyn std::fmt::Display) -> PluginRuntimeError {
    PluginRuntimeError::InvalidManifest(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Capability;
    use crate::permission::{Permission, PermissionLevel};

    const TOML_MANIFEST: &str = r#"
id = "reporter"
name = "Report Generator"
version = "2.1.0"
author = "Analytics"
category = "reporting"
tags = ["pdf", "batch"]
capabilities = ["data", "scheduled"]

[[permissions]]
type = "file"
resource = "/var/reports/*"
action = "write"
level = "write"

[[dependencies]]
id = "storage"
version_req = "^1.0"
"#;

    #[tokio::test]
    async fn test_load_toml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.toml");
        std::fs::write(&path, TOML_MANIFEST).unwrap();

        let descriptor = load_descriptor(&path).await.unwrap();
        assert_eq!(descriptor.id, "reporter");
        assert!(descriptor.has_capability(Capability::Scheduled));
        assert_eq!(
            descriptor.permissions,
            vec![Permission::file("/var/reports/*", "write", PermissionLevel::Write)]
        );
        assert_eq!(descriptor.dependencies[0].version_req, "^1.0");
    }

    #[test]
    fn test_yaml_and_json_agree() {
        let yaml = "id: p1\nname: One\nversion: 1.0.0\ncapabilities: [event]\n";
        let json = r#"{"id":"p1","name":"One","version":"1.0.0","capabilities":["event"]}"#;
        assert_eq!(
            parse_descriptor(yaml, ManifestFormat::Yaml).unwrap(),
            parse_descriptor(json, ManifestFormat::Json).unwrap()
        );
    }

    #[test]
    fn test_parse_and_validation_errors_are_invalid_manifest() {
        for (text, format) in [
            ("{ not json", ManifestFormat::Json),
            (r#"{"id":"p1","name":"One","version":"one"}"#, ManifestFormat::Json),
            ("id: p1\nname: One\nversion: 1.0.0\ncapabilities: [telepathy]\n", ManifestFormat::Yaml),
        ] {
            assert!(matches!(
                parse_descriptor(text, format),
                Err(PluginRuntimeError::InvalidManifest(_))
            ));
        }
        assert!(ManifestFormat::from_path(Path::new("plugin.ini")).is_err());
    }
}
