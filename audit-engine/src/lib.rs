//! Security audit trail for the plugin runtime
//!
//! This crate records every security-relevant decision the runtime makes:
//! - Permission decisions (granted / denied)
//! - Permission grants and revocations
//! - Security policy changes
//! - Detected violations of resource restrictions
//!
//! Entries are append-only and chained with SHA-256 so that any later edit,
//! removal or reordering is detectable with [`AuditTrail::verify_integrity`].
//! Recording never blocks on I/O and never alters the outcome of the
//! operation being observed.
//!
//! # Example
//!
//! ```rust
//! use audit_engine::{AuditQuery, AuditRecord, AuditTrail, SecurityAuditor};
//! use serde_json::json;
//!
//! let trail = AuditTrail::default();
//! trail.record(AuditRecord::permission_decision("p1", false, json!({"resource": "/etc/passwd"})));
//!
//! let denied = trail.query(&AuditQuery::new().subject("p1"));
//! assert_eq!(denied.len(), 1);
//! trail.verify_integrity().unwrap();
//! ```

pub mod entry;
pub mod error;
pub mod trail;

pub use entry::*;
pub use error::*;
pub use trail::*;

/// Logging collaborator that observes security decisions.
///
/// Implementations must not block and must not fail the caller.
pub trait SecurityAuditor: Send + Sync {
    fn record(&self, record: AuditRecord);
}
