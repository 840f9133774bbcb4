//! Plugin runtime error types
//!
//! One error enum for the whole runtime. Structural errors (bad manifest,
//! illegal transition, denied permission) are returned synchronously and are
//! never retryable; transient operational errors carry enough context for
//! the caller to decide whether to try again.

use std::fmt;
use thiserror::Error;

use crate::descriptor::Capability;
use crate::lifecycle::LifecycleState;
use events_bus::EventBusError;

/// Main plugin runtime error type
#[derive(Error, Debug)]
pub enum PluginRuntimeError {
    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// A plugin with the same id is already registered
    #[error("Plugin already exists: {0}")]
    PluginAlreadyExists(String),

    /// Invalid plugin manifest
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Transition not present in the lifecycle table
    #[error("Invalid state transition for plugin {plugin_id}: {from} -> {to}")]
    InvalidStateTransition {
        plugin_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Plugin initialization hook failed
    #[error("Initialization of plugin {plugin_id} failed: {source}")]
    InitializationFailed {
        plugin_id: String,
        #[source]
        source: Box<PluginRuntimeError>,
    },

    /// Plugin start hook failed
    #[error("Start of plugin {plugin_id} failed: {source}")]
    StartFailed {
        plugin_id: String,
        #[source]
        source: Box<PluginRuntimeError>,
    },

    /// Plugin stop hook failed
    #[error("Stop of plugin {plugin_id} failed: {source}")]
    StopFailed {
        plugin_id: String,
        #[source]
        source: Box<PluginRuntimeError>,
    },

    /// Permission check failed
    #[error("Permission denied for plugin {plugin_id}: {permission} ({reason})")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
        reason: String,
    },

    /// Resource quota exceeded
    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// Plugin operation exceeded its deadline
    #[error("Plugin operation '{operation}' timed out after {timeout_ms}ms")]
    ExecutionTimeout { operation: String, timeout_ms: u64 },

    /// Asynchronous event queue is saturated
    #[error("Event queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Declared dependency absent or version mismatch
    #[error("Plugin {plugin_id} requires {dependency} {requirement}")]
    DependencyMissing {
        plugin_id: String,
        dependency: String,
        requirement: String,
    },

    /// Security policy failed validation
    #[error("Invalid security policy: {0}")]
    InvalidPolicy(String),

    /// Plugin does not implement the requested capability
    #[error("Plugin {plugin_id} does not provide the {capability} capability")]
    CapabilityUnavailable {
        plugin_id: String,
        capability: Capability,
    },

    /// Operation requires a started plugin
    #[error("Plugin {plugin_id} is not running (state: {state})")]
    PluginNotRunning {
        plugin_id: String,
        state: LifecycleState,
    },

    /// Event bus / message broker failure
    #[error("Plugin communication error: {0}")]
    Communication(#[source] EventBusError),

    /// Snapshot storage failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by plugin code
    #[error("Plugin error in {context}: {message}")]
    Plugin { context: String, message: String },
}

/// Plugin runtime result type
pub type PluginResult<T> = Result<T, PluginRuntimeError>;

impl PluginRuntimeError {
    /// Create a plugin-reported error with context
    pub fn with_context(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Plugin {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::ExecutionTimeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether this error, or the failure it wraps, is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ExecutionTimeout { .. } => true,
            Self::Communication(EventBusError::RequestTimeout { .. }) => true,
            Self::InitializationFailed { source, .. }
            | Self::StartFailed { source, .. }
            | Self::StopFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExecutionTimeout { .. }
            | Self::QueueFull { .. }
            | Self::Persistence(_)
            | Self::Io(_) => true,
            Self::Communication(e) => !matches!(
                e,
                EventBusError::HandlerAlreadyRegistered(_) | EventBusError::ReplyLoop { .. }
            ),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PluginNotFound(_) => ErrorCategory::NotFound,
            Self::PluginAlreadyExists(_) => ErrorCategory::Conflict,
            Self::InvalidManifest(_) | Self::InvalidPolicy(_) => ErrorCategory::Validation,
            Self::InvalidStateTransition { .. } | Self::PluginNotRunning { .. } => ErrorCategory::State,
            Self::InitializationFailed { .. } | Self::StartFailed { .. } | Self::StopFailed { .. } => {
                ErrorCategory::Lifecycle
            }
            Self::PermissionDenied { .. } => ErrorCategory::Security,
            Self::ResourceExceeded(_) | Self::QueueFull { .. } => ErrorCategory::Resource,
            Self::ExecutionTimeout { .. } => ErrorCategory::Timeout,
            Self::DependencyMissing { .. } => ErrorCategory::Dependency,
            Self::CapabilityUnavailable { .. } => ErrorCategory::Capability,
            Self::Communication(_) => ErrorCategory::Communication,
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Plugin { .. } => ErrorCategory::Plugin,
        }
    }
}

impl From<EventBusError> for PluginRuntimeError {
    fn from(err: EventBusError) -> Self {
        match err {
            EventBusError::QueueFull { capacity } => Self::QueueFull { capacity },
            other => Self::Communication(other),
        }
    }
}

impl From<config::ConfigError> for PluginRuntimeError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Validation,
    State,
    Lifecycle,
    Security,
    Resource,
    Timeout,
    Dependency,
    Capability,
    Communication,
    Persistence,
    Configuration,
    Io,
    Serialization,
    Plugin,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::State => write!(f, "state"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Security => write!(f, "security"),
            Self::Resource => write!(f, "resource"),
            Self::Timeout => write!(f, "timeout"),
            Self::Dependency => write!(f, "dependency"),
            Self::Capability => write!(f, "capability"),
            Self::Communication => write!(f, "communication"),
            Self::Persistence => write!(f, "persistence"),
            Self::Configuration => write!(f, "configuration"),
            Self::Io => write!(f, "io"),
            Self::Serialization => write!(f, "serialization"),
            Self::Plugin => write!(f, "plugin"),
        }
    }
}
