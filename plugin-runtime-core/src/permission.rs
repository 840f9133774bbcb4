//! Permission model
//!
//! A permission is a `(type, resource, action, level)` tuple. Granted
//! permissions may use wildcards:
//! - resource `*` matches every resource
//! - a resource ending in `*` matches every resource it is a prefix of
//! - action `*` matches every action
//!
//! Levels are totally ordered `none < read < write < admin`; a grant covers
//! every request at or below its level.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PluginResult, PluginRuntimeError};

/// Resource class a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionType {
    File,
    Network,
    System,
    Api,
    Data,
    Config,
}

/// Access level, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None,
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub permission_type: PermissionType,
    pub resource: String,
    pub action: String,
    pub level: PermissionLevel,
}

impl Permission {
    pub fn new(
        permission_type: PermissionType,
        resource: impl Into<String>,
        action: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        Self {
            permission_type,
            resource: resource.into(),
            action: action.into(),
            level,
        }
    }

    pub fn file(resource: impl Into<String>, action: impl Into<String>, level: PermissionLevel) -> Self {
        Self::new(PermissionType::File, resource, action, level)
    }

    pub fn network(resource: impl Into<String>, action: impl Into<String>, level: PermissionLevel) -> Self {
        Self::new(PermissionType::Network, resource, action, level)
    }

    /// Structural validity: non-empty resource and action.
    ///
    /// Type and level are closed enums and cannot be unknown once parsed.
    pub fn validate(&self) -> PluginResult<()> {
        if self.resource.trim().is_empty() {
            return Err(PluginRuntimeError::InvalidManifest(format!(
                "permission {self} has an empty resource"
            )));
        }
        if self.action.trim().is_empty() {
            return Err(PluginRuntimeError::InvalidManifest(format!(
                "permission {self} has an empty action"
            )));
        }
        Ok(())
    }

    /// Whether this granted permission covers `requested`.
    pub fn grants(&self, requested: &Permission) -> bool {
        self.permission_type == requested.permission_type
            && resource_matches(&self.resource, &requested.resource)
            && (self.action == "*" || self.action == requested.action)
            && self.level >= requested.level
    }
}

fn resource_matches(granted: &str, requested: &str) -> bool {
    if granted == "*" || granted == requested {
        return true;
    }
    granted
        .strip_suffix('*')
        .is_some_and(|prefix| requested.starts_with(prefix))
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Network => write!(f, "network"),
            Self::System => write!(f, "system"),
            Self::Api => write!(f, "api"),
            Self::Data => write!(f, "data"),
            Self::Config => write!(f, "config"),
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.permission_type, self.resource, self.action, self.level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_resource_and_action() {
        let granted = Permission::file("/data/*", "*", PermissionLevel::Write);
        let requested = Permission::file("/data/config.json", "read", PermissionLevel::Read);
        assert!(granted.grants(&requested));
    }

    #[test]
    fn test_level_must_be_sufficient() {
        let granted = Permission::file("/tmp/*", "write", PermissionLevel::Read);
        let requested = Permission::file("/tmp/out.log", "write", PermissionLevel::Write);
        assert!(!granted.grants(&requested));
    }

    #[test]
    fn test_type_must_match() {
        let granted = Permission::file("*", "*", PermissionLevel::Admin);
        let requested = Permission::network("example.com:443", "connect", PermissionLevel::Read);
        assert!(!granted.grants(&requested));
    }

    #[test]
    fn test_non_trailing_star_is_literal() {
        let granted = Permission::file("/data/*/config", "read", PermissionLevel::Read);
        assert!(!granted.grants(&Permission::file("/data/a/config", "read", PermissionLevel::Read)));
        assert!(granted.grants(&Permission::file("/data/*/config", "read", PermissionLevel::Read)));
    }

    #[test]
    fn test_serialized_shape() {
        let p = Permission::file("/tmp/*", "read", PermissionLevel::Read);
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "file", "resource": "/tmp/*", "action": "read", "level": "read"})
        );
        assert!(serde_json::from_str::<Permission>(
            r#"{"type":"disk","resource":"/","action":"read","level":"read"}"#
        )
        .is_err());
    }

    #[test]
    fn test_empty_resource_is_invalid() {
        let p = Permission::file(" ", "read", PermissionLevel::Read);
        assert!(matches!(p.validate(), Err(PluginRuntimeError::InvalidManifest(_))));
    }

    fn level() -> impl Strategy<Value = PermissionLevel> {
        prop_oneof![
            Just(PermissionLevel::None),
            Just(PermissionLevel::Read),
            Just(PermissionLevel::Write),
            Just(PermissionLevel::Admin),
        ]
    }

    proptest! {
        #[test]
        fn prop_exact_grant_covers_itself_and_lower_levels(
            resource in "/[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            action in "[a-z]{1,8}",
            granted_level in level(),
            requested_level in level(),
        ) {
            let granted = Permission::file(resource.clone(), action.clone(), granted_level);
            let requested = Permission::file(resource, action, requested_level);
            prop_assert_eq!(granted.grants(&requested), granted_level >= requested_level);
        }

        #[test]
        fn prop_prefix_wildcard_covers_children(
            prefix in "/[a-z]{1,8}/",
            child in "[a-z]{1,8}(/[a-z]{1,8}){0,2}",
            other in "/[A-Z]{1,8}",
        ) {
            let granted = Permission::file(format!("{prefix}*"), "*", PermissionLevel::Admin);
            let under = Permission::file(format!("{prefix}{child}"), "read", PermissionLevel::Admin);
            let outside = Permission::file(other, "read", PermissionLevel::Read);
            prop_assert!(granted.grants(&under));
            prop_assert!(!granted.grants(&outside));
        }
    }
}
