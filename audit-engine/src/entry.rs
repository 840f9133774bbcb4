// Audit entry types and structures
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A permission check was answered
    PermissionDecision,
    /// A permission was granted or revoked
    PermissionChange,
    /// A security policy was applied or rejected
    PolicyChange,
    /// A request hit a policy restriction
    Violation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Granted,
    Denied,
    Revoked,
    Applied,
    Rejected,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDecision => write!(f, "permission_decision"),
            Self::PermissionChange => write!(f, "permission_change"),
            Self::PolicyChange => write!(f, "policy_change"),
            Self::Violation => write!(f, "violation"),
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
            Self::Revoked => write!(f, "revoked"),
            Self::Applied => write!(f, "applied"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// What an observer submits; the trail stamps sequence, time and hashes.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: AuditEventKind,
    pub subject: String,
    pub actor: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub data: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        kind: AuditEventKind,
        subject: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            kind,
            subject: subject.into(),
            actor: None,
            action: action.into(),
            outcome,
            data: serde_json::Value::Null,
        }
    }

    pub fn permission_decision(subject: impl Into<String>, granted: bool, data: serde_json::Value) -> Self {
        let outcome = if granted { AuditOutcome::Granted } else { AuditOutcome::Denied };
        Self::new(AuditEventKind::PermissionDecision, subject, "check_permission", outcome).with_data(data)
    }

    pub fn violation(subject: impl Into<String>, action: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(AuditEventKind::Violation, subject, action, AuditOutcome::Denied).with_data(data)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Sealed, chained audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub subject: String,
    pub actor: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    pub(crate) fn seal(record: AuditRecord, sequence: u64, prev_hash: String) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            kind: record.kind,
            subject: record.subject,
            actor: record.actor,
            action: record.action,
            outcome: record.outcome,
            data: record.data,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// SHA-256 over every field except `hash` itself, hex encoded.
    ///
    /// Each field is length-prefixed so that moving bytes between adjacent
    /// fields changes the digest.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, self.id.as_bytes());
        hash_field(&mut hasher, &self.sequence.to_be_bytes());
        hash_field(&mut hasher, self.timestamp.to_rfc3339().as_bytes());
        hash_field(&mut hasher, self.kind.to_string().as_bytes());
        hash_field(&mut hasher, self.subject.as_bytes());
        match &self.actor {
            Some(actor) => {
                hasher.update([1u8]);
                hash_field(&mut hasher, actor.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hash_field(&mut hasher, self.action.as_bytes());
        hash_field(&mut hasher, self.outcome.to_string().as_bytes());
        hash_field(&mut hasher, self.data.to_string().as_bytes());
        hash_field(&mut hasher, self.prev_hash.as_bytes());

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
