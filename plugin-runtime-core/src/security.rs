//! Plugin security and permission management
//!
//! Provides the capability-based security boundary of the runtime:
//! - structural validation of plugin descriptors
//! - per-plugin permission sets with idempotent grant/revoke
//! - wildcard permission checks plus enforcement of policy restrictions
//! - per-plugin security contexts and atomic policy replacement
//!
//! Every decision, permission change, policy change and restriction
//! violation is handed to the injected [`SecurityAuditor`].

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use audit_engine::{AuditEventKind, AuditOutcome, AuditRecord, SecurityAuditor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::permission::{Permission, PermissionType};

const MAX_ID_LENGTH: usize = 64;

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum plugin name length in characters
    pub max_name_length: usize,
    /// Accept pre-release versions such as `1.0.0-beta.1`
    pub allow_prerelease: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_name_length: 128,
            allow_prerelease: true,
        }
    }
}

/// Resource restrictions enforced on top of permission grants
///
/// Path entries are absolute; an entry ending in `*` is a string prefix,
/// otherwise it covers the path and everything below it. Host entries are
/// hostnames, IP addresses, or `*.domain` suffix patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRestrictions {
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub allowed_ports: Vec<u16>,
    pub denied_ports: Vec<u16>,
    pub max_execution_time_ms: Option<u64>,
    pub max_connections: Option<u32>,
}

/// Sandbox parameters carried with a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxParameters {
    /// Maximum memory usage (bytes)
    pub max_memory_bytes: u64,
    /// Maximum CPU time per execution (milliseconds)
    pub max_cpu_time_ms: u64,
    /// Maximum file operations per execution
    pub max_file_operations: u32,
    /// Maximum concurrent network connections
    pub max_network_connections: u32,
}

impl Default for SandboxParameters {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_cpu_time_ms: 10_000,
            max_file_operations: 100,
            max_network_connections: 5,
        }
    }
}

/// Security policy for a plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub permissions: Vec<Permission>,
    pub restrictions: ResourceRestrictions,
    pub sandbox: SandboxParameters,
}

impl SecurityPolicy {
    pub fn new(permissions: Vec<Permission>) -> Self {
        Self {
            permissions,
            ..Self::default()
        }
    }

    pub fn with_restrictions(mut self, restrictions: ResourceRestrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxParameters) -> Self {
        self.sandbox = sandbox;
        self
    }
}

/// Per-plugin snapshot of active permissions and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub plugin_id: String,
    pub permissions: Vec<Permission>,
    pub policy: Option<SecurityPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct PluginSecurity {
    permissions: BTreeSet<Permission>,
    policy: Option<SecurityPolicy>,
    context: Option<SecurityContext>,
}

impl PluginSecurity {
    fn refresh_context(&mut self) {
        let permissions: Vec<Permission> = self.permissions.iter().cloned().collect();
        let policy = self.policy.clone();
        if let Some(ctx) = self.context.as_mut() {
            ctx.permissions = permissions;
            ctx.policy = policy;
            ctx.updated_at = Utc::now();
        }
    }
}

/// Security manager for plugin permissions
pub struct SecurityManager {
    plugins: parking_lot::RwLock<HashMap<String, PluginSecurity>>,
    auditor: Arc<dyn SecurityAuditor>,
    config: SecurityConfig,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig, auditor: Arc<dyn SecurityAuditor>) -> Self {
        Self {
            plugins: parking_lot::RwLock::new(HashMap::new()),
            auditor,
            config,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Structural checks on a descriptor.
    pub fn validate_plugin(&self, descriptor: &PluginDescriptor) -> PluginResult<()> {
        validate_descriptor(descriptor, &self.config)
    }

    /// Add `permission` to the plugin's set. Returns `false` when it was
    /// already present.
    pub fn grant_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: Option<&str>,
    ) -> PluginResult<bool> {
        permission.validate()?;

        let inserted = {
            let mut plugins = self.plugins.write();
            let entry = plugins.entry(plugin_id.to_string()).or_default();
            let inserted = entry.permissions.insert(permission.clone());
            if inserted {
                entry.refresh_context();
            }
            inserted
        };

        if inserted {
            info!(plugin_id = %plugin_id, permission = %permission, "Permission granted");
            self.audit_change(plugin_id, "grant_permission", AuditOutcome::Granted, &permission, actor);
        } else {
            debug!(plugin_id = %plugin_id, permission = %permission, "Permission already granted");
        }
        Ok(inserted)
    }

    /// Remove an exact permission tuple. Returns `false` when it was not held.
    pub fn revoke_permission(&self, plugin_id: &str, permission: &Permission, actor: Option<&str>) -> bool {
        let removed = {
            let mut plugins = self.plugins.write();
            match plugins.get_mut(plugin_id) {
                Some(entry) => {
                    let removed = entry.permissions.remove(permission);
                    if removed {
                        entry.refresh_context();
                    }
                    removed
                }
                None => false,
            }
        };

        if removed {
            info!(plugin_id = %plugin_id, permission = %permission, "Permission revoked");
            self.audit_change(plugin_id, "revoke_permission", AuditOutcome::Revoked, permission, actor);
        }
        removed
    }

    pub fn get_permissions(&self, plugin_id: &str) -> Vec<Permission> {
        self.plugins
            .read()
            .get(plugin_id)
            .map(|entry| entry.permissions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Succeeds only if a granted permission covers `requested` and no policy
    /// restriction forbids the requested resource.
    pub fn check_permission(&self, plugin_id: &str, requested: &Permission) -> PluginResult<()> {
        let decision = match canonical_request(requested) {
            Err(reason) => Decision::Violation(reason),
            Ok(effective) => {
                let plugins = self.plugins.read();
                match plugins.get(plugin_id) {
                    None => Decision::Denied("no permissions granted".to_string()),
                    Some(entry) => match entry.permissions.iter().find(|p| p.grants(&effective)) {
                        None => Decision::Denied("no matching grant".to_string()),
                        Some(granted) => {
                            let restrictions = entry.policy.as_ref().map(|p| &p.restrictions);
                            match restrictions.and_then(|r| restriction_violation(r, &effective)) {
                                Some(reason) => Decision::Violation(reason),
                                None => Decision::Granted(granted.clone()),
                            }
                        }
                    },
                }
            }
        };

        match decision {
            Decision::Granted(granted) => {
                debug!(plugin_id = %plugin_id, permission = %requested, granted_by = %granted, "Permission check passed");
                self.auditor.record(AuditRecord::permission_decision(
                    plugin_id,
                    true,
                    json!({ "permission": requested, "granted_by": granted }),
                ));
                Ok(())
            }
            Decision::Denied(reason) => {
                debug!(plugin_id = %plugin_id, permission = %requested, reason = %reason, "Permission check denied");
                self.auditor.record(AuditRecord::permission_decision(
                    plugin_id,
                    false,
                    json!({ "permission": requested, "reason": reason }),
                ));
                Err(denied(plugin_id, requested, reason))
            }
            Decision::Violation(reason) => {
                warn!(plugin_id = %plugin_id, permission = %requested, reason = %reason, "Security restriction violated");
                self.auditor.record(AuditRecord::violation(
                    plugin_id,
                    "check_permission",
                    json!({ "permission": requested, "reason": reason }),
                ));
                self.auditor.record(AuditRecord::permission_decision(
                    plugin_id,
                    false,
                    json!({ "permission": requested, "reason": reason }),
                ));
                Err(denied(plugin_id, requested, reason))
            }
        }
    }

    /// Boolean form of [`Self::check_permission`].
    pub fn is_permitted(&self, plugin_id: &str, requested: &Permission) -> bool {
        self.check_permission(plugin_id, requested).is_ok()
    }

    /// Return the plugin's context, creating it from the current permissions
    /// and policy on first use.
    pub fn create_security_context(&self, plugin_id: &str) -> SecurityContext {
        let mut plugins = self.plugins.write();
        let entry = plugins.entry(plugin_id.to_string()).or_default();

        if let Some(ctx) = &entry.context {
            return ctx.clone();
        }

        let now = Utc::now();
        let ctx = SecurityContext {
            plugin_id: plugin_id.to_string(),
            permissions: entry.permissions.iter().cloned().collect(),
            policy: entry.policy.clone(),
            created_at: now,
            updated_at: now,
        };
        entry.context = Some(ctx.clone());
        debug!(plugin_id = %plugin_id, "Security context created");
        ctx
    }

    pub fn security_context(&self, plugin_id: &str) -> Option<SecurityContext> {
        self.plugins.read().get(plugin_id).and_then(|e| e.context.clone())
    }

    pub fn policy(&self, plugin_id: &str) -> Option<SecurityPolicy> {
        self.plugins.read().get(plugin_id).and_then(|e| e.policy.clone())
    }

    /// Validate `policy`, then atomically replace the plugin's permission
    /// set and policy.
    pub fn apply_security_policy(
        &self,
        plugin_id: &str,
        policy: SecurityPolicy,
        actor: Option<&str>,
    ) -> PluginResult<()> {
        if let Err(e) = validate_policy(&policy) {
            warn!(plugin_id = %plugin_id, error = %e, "Security policy rejected");
            let mut record = AuditRecord::new(
                AuditEventKind::PolicyChange,
                plugin_id,
                "apply_security_policy",
                AuditOutcome::Rejected,
            )
            .with_data(json!({ "reason": e.to_string() }));
            if let Some(actor) = actor {
                record = record.with_actor(actor);
            }
            self.auditor.record(record);
            return Err(e);
        }

        let permission_count = {
            let mut plugins = self.plugins.write();
            let entry = plugins.entry(plugin_id.to_string()).or_default();
            entry.permissions = policy.permissions.iter().cloned().collect();
            entry.policy = Some(policy.clone());
            entry.refresh_context();
            entry.permissions.len()
        };

        info!(plugin_id = %plugin_id, permissions = permission_count, "Security policy applied");
        let mut record = AuditRecord::new(
            AuditEventKind::PolicyChange,
            plugin_id,
            "apply_security_policy",
            AuditOutcome::Applied,
        )
        .with_data(json!({ "policy": policy }));
        if let Some(actor) = actor {
            record = record.with_actor(actor);
        }
        self.auditor.record(record);
        Ok(())
    }

    /// Drop all security state held for a plugin.
    pub fn remove_plugin(&self, plugin_id: &str) -> bool {
        let removed = self.plugins.write().remove(plugin_id).is_some();
        if removed {
            debug!(plugin_id = %plugin_id, "Security state removed");
        }
        removed
    }

    fn audit_change(
        &self,
        plugin_id: &str,
        action: &str,
        outcome: AuditOutcome,
        permission: &Permission,
        actor: Option<&str>,
    ) {
        let mut record = AuditRecord::new(AuditEventKind::PermissionChange, plugin_id, action, outcome)
            .with_data(json!({ "permission": permission }));
        if let Some(actor) = actor {
            record = record.with_actor(actor);
        }
        self.auditor.record(record);
    }
}

enum Decision {
    Granted(Permission),
    Denied(String),
    Violation(String),
}

fn denied(plugin_id: &str, requested: &Permission, reason: String) -> PluginRuntimeError {
    PluginRuntimeError::PermissionDenied {
        plugin_id: plugin_id.to_string(),
        permission: requested.to_string(),
        reason,
    }
}

/// Structural descriptor validation shared by the manager and the loader.
pub fn validate_descriptor(descriptor: &PluginDescriptor, config: &SecurityConfig) -> PluginResult<()> {
    validate_plugin_id(&descriptor.id)?;

    if descriptor.name.trim().is_empty() {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin {} has an empty name",
            descriptor.id
        )));
    }
    if descriptor.name.chars().count() > config.max_name_length {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin {} name exceeds {} characters",
            descriptor.id, config.max_name_length
        )));
    }

    let version = descriptor.semver()?;
    if !version.build.is_empty() {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin {} version '{}' carries build metadata",
            descriptor.id, descriptor.version
        )));
    }
    if !version.pre.is_empty() && !config.allow_prerelease {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin {} version '{}' is a pre-release",
            descriptor.id, descriptor.version
        )));
    }

    for permission in &descriptor.permissions {
        permission.validate()?;
    }

    for dependency in &descriptor.dependencies {
        validate_plugin_id(&dependency.id)?;
        if dependency.id == descriptor.id {
            return Err(PluginRuntimeError::InvalidManifest(format!(
                "plugin {} depends on itself",
                descriptor.id
            )));
        }
        dependency.requirement()?;
    }
    Ok(())
}

fn validate_plugin_id(id: &str) -> PluginResult<()> {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin id '{id}' must be 1-{MAX_ID_LENGTH} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PluginRuntimeError::InvalidManifest(format!(
            "plugin id '{id}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

fn validate_policy(policy: &SecurityPolicy) -> PluginResult<()> {
    for permission in &policy.permissions {
        permission
            .validate()
            .map_err(|e| PluginRuntimeError::InvalidPolicy(e.to_string()))?;
    }

    let r = &policy.restrictions;
    for path in r.allowed_paths.iter().chain(&r.denied_paths) {
        if !Path::new(path.trim_end_matches('*')).is_absolute() {
            return Err(PluginRuntimeError::InvalidPolicy(format!(
                "restriction path '{path}' is not absolute"
            )));
        }
    }
    for host in r.allowed_hosts.iter().chain(&r.denied_hosts) {
        if !is_valid_host_pattern(host) {
            return Err(PluginRuntimeError::InvalidPolicy(format!(
                "restriction host '{host}' is not a valid hostname or address"
            )));
        }
    }
    if let Some(port) = r.allowed_ports.iter().chain(&r.denied_ports).find(|p| **p == 0) {
        return Err(PluginRuntimeError::InvalidPolicy(format!(
            "restriction port {port} is outside 1-65535"
        )));
    }
    if r.max_execution_time_ms == Some(0) {
        return Err(PluginRuntimeError::InvalidPolicy(
            "max_execution_time_ms must be positive".to_string(),
        ));
    }
    Ok(())
}

fn is_valid_host_pattern(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    let name = host.strip_prefix("*.").unwrap_or(host);
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// File requests are matched in lexically normalized form; a path that
/// climbs above its root is refused outright.
fn canonical_request(requested: &Permission) -> Result<Cow<'_, Permission>, String> {
    if requested.permission_type != PermissionType::File {
        return Ok(Cow::Borrowed(requested));
    }
    let resource = normalize_path(&requested.resource)
        .ok_or_else(|| format!("path {} climbs above its root", requested.resource))?;
    if resource == requested.resource {
        Ok(Cow::Borrowed(requested))
    } else {
        Ok(Cow::Owned(Permission {
            resource,
            ..requested.clone()
        }))
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &str) -> Option<String> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => return None,
            },
            other => parts.push(other),
        }
    }
    let normalized: PathBuf = parts.iter().collect();
    Some(normalized.to_string_lossy().into_owned())
}

fn path_covered(entry: &str, resource: &str) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => Path::new(resource).starts_with(entry),
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    if let (Ok(pattern), Ok(host)) = (pattern.parse::<IpAddr>(), host.parse::<IpAddr>()) {
        return pattern == host;
    }
    pattern.strip_prefix("*.").is_some_and(|domain| {
        host.len() > domain.len()
            && host.to_ascii_lowercase().ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    })
}

/// Split `host[:port]` or `[v6-address][:port]`. `None` when the port part
/// is malformed.
fn split_host_port(resource: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = resource.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if tail.is_empty() {
            return Some((host, None));
        }
        let port = tail.strip_prefix(':')?.parse::<u16>().ok()?;
        return Some((host, Some(port)));
    }
    match resource.rsplit_once(':') {
        // More than one colon: a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Some((resource, None)),
        Some((host, port)) => port.parse::<u16>().ok().map(|port| (host, Some(port))),
        None => Some((resource, None)),
    }
}

fn restriction_violation(r: &ResourceRestrictions, requested: &Permission) -> Option<String> {
    match requested.permission_type {
        PermissionType::File => {
            let resource = requested.resource.as_str();
            if let Some(entry) = r.denied_paths.iter().find(|e| path_covered(e, resource)) {
                return Some(format!("path {resource} is denied by {entry}"));
            }
            if !r.allowed_paths.is_empty() && !r.allowed_paths.iter().any(|e| path_covered(e, resource)) {
                return Some(format!("path {resource} is outside the allowed paths"));
            }
            None
        }
        PermissionType::Network => {
            let Some((host, port)) = split_host_port(&requested.resource) else {
                return Some(format!("network resource {} is malformed", requested.resource));
            };
            if let Some(entry) = r.denied_hosts.iter().find(|p| host_matches(p, host)) {
                return Some(format!("host {host} is denied by {entry}"));
            }
            if !r.allowed_hosts.is_empty() && !r.allowed_hosts.iter().any(|p| host_matches(p, host)) {
                return Some(format!("host {host} is outside the allowed hosts"));
            }
            if let Some(port) = port {
                if r.denied_ports.contains(&port) {
                    return Some(format!("port {port} is denied"));
                }
                if !r.allowed_ports.is_empty() && !r.allowed_ports.contains(&port) {
                    return Some(format!("port {port} is outside the allowed ports"));
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionLevel;
    use audit_engine::{AuditQuery, AuditTrail};

    fn manager() -> (SecurityManager, Arc<AuditTrail>) {
        let trail = Arc::new(AuditTrail::default());
        (SecurityManager::new(SecurityConfig::default(), trail.clone()), trail)
    }

    #[test]
    fn test_validate_plugin_rules() {
        let (security, _) = manager();
        assert!(security
            .validate_plugin(&PluginDescriptor::new("p1", "Plugin One", "1.0.0"))
            .is_ok());
        assert!(security
            .validate_plugin(&PluginDescriptor::new("p_1-beta", "x", "1.0.0-rc.1"))
            .is_ok());

        for bad in [
            PluginDescriptor::new("", "name", "1.0.0"),
            PluginDescriptor::new("has space", "name", "1.0.0"),
            PluginDescriptor::new("a".repeat(65), "name", "1.0.0"),
            PluginDescriptor::new("p1", "  ", "1.0.0"),
            PluginDescriptor::new("p1", "n".repeat(129), "1.0.0"),
            PluginDescriptor::new("p1", "name", "1.0"),
            PluginDescriptor::new("p1", "name", "1.0.0+build.5"),
            PluginDescriptor::new("p1", "name", "1.0.0")
                .with_permission(Permission::file("", "read", PermissionLevel::Read)),
        ] {
            assert!(
                matches!(security.validate_plugin(&bad), Err(PluginRuntimeError::InvalidManifest(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_grant_is_idempotent_and_audited_once() {
        let (security, trail) = manager();
        let p = Permission::file("/tmp/*", "read", PermissionLevel::Read);

        assert!(security.grant_permission("p1", p.clone(), Some("admin")).unwrap());
        assert!(!security.grant_permission("p1", p.clone(), Some("admin")).unwrap());
        assert_eq!(security.get_permissions("p1").len(), 1);

        let changes = trail.query(&AuditQuery::new().kind(AuditEventKind::PermissionChange));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].actor.as_deref(), Some("admin"));
    }

    #[test]
    fn test_check_is_denied_then_granted() {
        let (security, trail) = manager();
        let requested = Permission::file("/tmp/report.txt", "read", PermissionLevel::Read);

        assert!(matches!(
            security.check_permission("p1", &requested),
            Err(PluginRuntimeError::PermissionDenied { .. })
        ));
        security
            .grant_permission("p1", Permission::file("/tmp/*", "read", PermissionLevel::Read), None)
            .unwrap();
        security.check_permission("p1", &requested).unwrap();

        let decisions = trail.query(&AuditQuery::new().kind(AuditEventKind::PermissionDecision));
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].outcome, AuditOutcome::Denied);
        assert_eq!(decisions[1].outcome, AuditOutcome::Granted);
    }

    #[test]
    fn test_revoke_removes_exact_tuple() {
        let (security, _) = manager();
        let p = Permission::file("/tmp/*", "read", PermissionLevel::Read);
        security.grant_permission("p1", p.clone(), None).unwrap();

        assert!(!security.revoke_permission("p1", &Permission::file("/tmp/*", "read", PermissionLevel::Write), None));
        assert!(security.revoke_permission("p1", &p, None));
        assert!(!security.is_permitted("p1", &Permission::file("/tmp/a", "read", PermissionLevel::Read)));
    }

    #[test]
    fn test_security_context_is_idempotent_and_follows_policy() {
        let (security, _) = manager();
        let first = security.create_security_context("p1");
        let second = security.create_security_context("p1");
        assert_eq!(first.created_at, second.created_at);
        assert!(first.permissions.is_empty());

        let policy = SecurityPolicy::new(vec![Permission::file("/data/*", "*", PermissionLevel::Write)]);
        security.apply_security_policy("p1", policy.clone(), None).unwrap();

        let ctx = security.security_context("p1").unwrap();
        assert_eq!(ctx.permissions, policy.permissions);
        assert_eq!(ctx.policy, Some(policy));
        assert_eq!(ctx.created_at, first.created_at);
    }

    #[test]
    fn test_policy_replaces_permissions_atomically() {
        let (security, _) = manager();
        security
            .grant_permission("p1", Permission::file("/old/*", "read", PermissionLevel::Read), None)
            .unwrap();

        let policy = SecurityPolicy::new(vec![
            Permission::file("/new/*", "read", PermissionLevel::Read),
            Permission::file("/new/*", "read", PermissionLevel::Read),
        ]);
        security.apply_security_policy("p1", policy, None).unwrap();

        assert_eq!(
            security.get_permissions("p1"),
            vec![Permission::file("/new/*", "read", PermissionLevel::Read)]
        );
    }

    #[test]
    fn test_invalid_policy_is_rejected_without_change() {
        let (security, trail) = manager();
        let p = Permission::file("/tmp/*", "read", PermissionLevel::Read);
        security.grant_permission("p1", p.clone(), None).unwrap();

        let bad_path = SecurityPolicy::default().with_restrictions(ResourceRestrictions {
            allowed_paths: vec!["relative/dir".into()],
            ..Default::default()
        });
        let bad_host = SecurityPolicy::default().with_restrictions(ResourceRestrictions {
            allowed_hosts: vec!["bad host!".into()],
            ..Default::default()
        });
        let bad_port = SecurityPolicy::default().with_restrictions(ResourceRestrictions {
            denied_ports: vec![0],
            ..Default::default()
        });

        for policy in [bad_path, bad_host, bad_port] {
            assert!(matches!(
                security.apply_security_policy("p1", policy, None),
                Err(PluginRuntimeError::InvalidPolicy(_))
            ));
        }
        assert_eq!(security.get_permissions("p1"), vec![p]);
        assert_eq!(
            trail
                .query(&AuditQuery::new().kind(AuditEventKind::PolicyChange).outcome(AuditOutcome::Rejected))
                .len(),
            3
        );
    }

    #[test]
    fn test_path_restrictions_override_grants() {
        let (security, trail) = manager();
        let policy = SecurityPolicy::new(vec![Permission::file("*", "*", PermissionLevel::Admin)])
            .with_restrictions(ResourceRestrictions {
                allowed_paths: vec!["/srv/plugins".into()],
                denied_paths: vec!["/srv/plugins/secrets".into()],
                ..Default::default()
            });
        security.apply_security_policy("p1", policy, None).unwrap();

        let read = |path: &str| Permission::file(path, "read", PermissionLevel::Read);
        assert!(security.is_permitted("p1", &read("/srv/plugins/p1/state.json")));
        assert!(!security.is_permitted("p1", &read("/srv/plugins/secrets/key")));
        assert!(!security.is_permitted("p1", &read("/etc/passwd")));
        assert!(!security.is_permitted("p1", &read("/srv/plugins-other/x")));

        assert_eq!(trail.query(&AuditQuery::new().kind(AuditEventKind::Violation)).len(), 3);
    }

    #[test]
    fn test_network_restrictions() {
        let (security, _) = manager();
        let policy = SecurityPolicy::new(vec![Permission::network("*", "connect", PermissionLevel::Read)])
            .with_restrictions(ResourceRestrictions {
                allowed_hosts: vec!["*.example.com".into(), "10.0.0.5".into()],
                denied_hosts: vec!["admin.example.com".into()],
                allowed_ports: vec![443, 8443],
                ..Default::default()
            });
        security.apply_security_policy("p1", policy, None).unwrap();

        let connect = |res: &str| Permission::network(res, "connect", PermissionLevel::Read);
        assert!(security.is_permitted("p1", &connect("api.example.com:443")));
        assert!(security.is_permitted("p1", &connect("10.0.0.5:8443")));
        assert!(security.is_permitted("p1", &connect("api.example.com")));
        assert!(!security.is_permitted("p1", &connect("api.example.com:80")));
        assert!(!security.is_permitted("p1", &connect("admin.example.com:443")));
        assert!(!security.is_permitted("p1", &connect("example.org:443")));
        assert!(!security.is_permitted("p1", &connect("example.com:443")));
    }

    #[test]
    fn test_dot_segments_cannot_leave_allowed_paths() {
        let (security, trail) = manager();
        let policy = SecurityPolicy::new(vec![Permission::file("*", "*", PermissionLevel::Admin)])
            .with_restrictions(ResourceRestrictions {
                allowed_paths: vec!["/srv/plugins".into()],
                denied_paths: vec!["/srv/plugins/secrets".into()],
                ..Default::default()
            });
        security.apply_security_policy("p1", policy, None).unwrap();

        let read = |path: &str| Permission::file(path, "read", PermissionLevel::Read);
        assert!(!security.is_permitted("p1", &read("/srv/plugins/p1/../secrets/key")));
        assert!(!security.is_permitted("p1", &read("/srv/plugins/./secrets/key")));
        assert!(!security.is_permitted("p1", &read("/srv/plugins/../../etc/passwd")));
        assert!(!security.is_permitted("p1", &read("/../srv/plugins/p1/a")));
        assert!(security.is_permitted("p1", &read("/srv/plugins/p1/tmp/../state.json")));

        assert_eq!(trail.query(&AuditQuery::new().kind(AuditEventKind::Violation)).len(), 4);
    }

    #[test]
    fn test_dot_segments_cannot_widen_prefix_grants() {
        let (security, _) = manager();
        security
            .grant_permission("p1", Permission::file("/data/*", "read", PermissionLevel::Read), None)
            .unwrap();

        let read = |path: &str| Permission::file(path, "read", PermissionLevel::Read);
        assert!(security.is_permitted("p1", &read("/data/a/../b.json")));
        assert!(!security.is_permitted("p1", &read("/data/../etc/shadow")));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/./b/../c").as_deref(), Some("/a/c"));
        assert_eq!(normalize_path("/a/b/").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("rel/x/..").as_deref(), Some("rel"));
        assert_eq!(normalize_path("/.."), None);
        assert_eq!(normalize_path("../x"), None);
    }

    #[test]
    fn test_bracketed_ipv6_ports_are_restricted() {
        let (security, _) = manager();
        let policy = SecurityPolicy::new(vec![Permission::network("*", "connect", PermissionLevel::Read)])
            .with_restrictions(ResourceRestrictions {
                denied_hosts: vec!["fd00::7".into()],
                denied_ports: vec![22],
                ..Default::default()
            });
        security.apply_security_policy("p1", policy, None).unwrap();

        let connect = |res: &str| Permission::network(res, "connect", PermissionLevel::Read);
        assert!(!security.is_permitted("p1", &connect("10.0.0.1:22")));
        assert!(!security.is_permitted("p1", &connect("[::1]:22")));
        assert!(security.is_permitted("p1", &connect("[::1]:443")));
        assert!(security.is_permitted("p1", &connect("[::1]")));
        assert!(!security.is_permitted("p1", &connect("[fd00:0::7]:443")));
        assert!(!security.is_permitted("p1", &connect("fd00::7")));
        assert!(!security.is_permitted("p1", &connect("[::1]:ssh")));
        assert!(!security.is_permitted("p1", &connect("host.example.com:99999")));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("[::1]:22"), Some(("::1", Some(22))));
        assert_eq!(split_host_port("[::1]"), Some(("::1", None)));
        assert_eq!(split_host_port("::1"), Some(("::1", None)));
        assert_eq!(split_host_port("example.com:8080"), Some(("example.com", Some(8080))));
        assert_eq!(split_host_port("example.com"), Some(("example.com", None)));
        assert_eq!(split_host_port("[::1]x"), None);
    }

    #[test]
    fn test_remove_plugin_drops_state() {
        let (security, _) = manager();
        security
            .grant_permission("p1", Permission::file("/tmp/*", "read", PermissionLevel::Read), None)
            .unwrap();
        security.create_security_context("p1");

        assert!(security.remove_plugin("p1"));
        assert!(security.get_permissions("p1").is_empty());
        assert!(security.security_context("p1").is_none());
        assert!(!security.remove_plugin("p1"));
    }
}
