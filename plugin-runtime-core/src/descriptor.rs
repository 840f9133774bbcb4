//! Plugin descriptor
//!
//! Immutable identity and metadata record for a plugin: what it is called,
//! which capabilities it implements, which permissions it asks for and which
//! other plugins it depends on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PluginResult, PluginRuntimeError};
use crate::permission::Permission;

/// Functional role a plugin declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Http,
    Event,
    Scheduled,
    Data,
    Configurable,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Http,
        Capability::Event,
        Capability::Scheduled,
        Capability::Data,
        Capability::Configurable,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Event => write!(f, "event"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Data => write!(f, "data"),
            Self::Configurable => write!(f, "configurable"),
        }
    }
}

/// Another plugin that must be registered before this one initializes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub id: String,
    /// Semver requirement, e.g. `^1.2`
    #[serde(default = "any_version")]
    pub version_req: String,
}

fn any_version() -> String {
    "*".to_string()
}

impl PluginDependency {
    pub fn new(id: impl Into<String>, version_req: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version_req: version_req.into(),
        }
    }

    pub fn requirement(&self) -> PluginResult<semver::VersionReq> {
        semver::VersionReq::parse(&self.version_req).map_err(|e| {
            PluginRuntimeError::InvalidManifest(format!(
                "dependency {} has invalid version requirement '{}': {e}",
                self.id, self.version_req
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            category: String::new(),
            tags: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Parsed semantic version.
    pub fn semver(&self) -> PluginResult<semver::Version> {
        semver::Version::parse(&self.version).map_err(|e| {
            PluginRuntimeError::InvalidManifest(format!(
                "plugin {} has invalid version '{}': {e}",
                self.id, self.version
            ))
        })
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}
