//! In-memory audit trail
//!
//! Entries are sealed into a SHA-256 hash chain as they are appended and are
//! never modified afterwards. Retention is bounded; when the bound is hit the
//! oldest entries fall off and verification starts from the oldest retained
//! entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::entry::{AuditEntry, AuditEventKind, AuditOutcome, AuditRecord};
use crate::error::{AuditError, Result};
use crate::SecurityAuditor;

const GENESIS_HASH: &str = "genesis";

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum number of retained entries
    pub max_entries: usize,
    /// Mirror every entry to `tracing` under the `audit` target
    pub mirror_to_tracing: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            mirror_to_tracing: true,
        }
    }
}

struct TrailState {
    entries: VecDeque<AuditEntry>,
    next_sequence: u64,
    last_hash: String,
}

pub struct AuditTrail {
    state: parking_lot::Mutex<TrailState>,
    config: AuditConfig,
}

/// Conjunctive filter over retained entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub subject: Option<String>,
    pub kind: Option<AuditEventKind>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn kind(mut self, kind: AuditEventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        self.subject.as_ref().map_or(true, |s| &entry.subject == s)
            && self.kind.map_or(true, |k| entry.kind == k)
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

impl AuditTrail {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            state: parking_lot::Mutex::new(TrailState {
                entries: VecDeque::new(),
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
            config,
        }
    }

    /// Seal and append `record`, returning its sequence number.
    pub fn append(&self, record: AuditRecord) -> u64 {
        let entry = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            let entry = AuditEntry::seal(record, sequence, state.last_hash.clone());

            state.next_sequence += 1;
            state.last_hash.clone_from(&entry.hash);
            state.entries.push_back(entry.clone());
            while state.entries.len() > self.config.max_entries.max(1) {
                state.entries.pop_front();
            }
            entry
        };

        if self.config.mirror_to_tracing {
            mirror(&entry);
        }
        entry.sequence
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Recompute every retained hash and check the links between them.
    pub fn verify_integrity(&self) -> Result<()> {
        let state = self.state.lock();
        verify_chain(state.entries.iter())
    }

    /// Write the retained entries to `path` as JSON lines.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize> {
        let entries = self.entries();
        let mut buffer = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::File::create(path.as_ref())
            .await
            .map_err(|e| AuditError::ExportError(format!("{}: {e}", path.as_ref().display())))?;
        file.write_all(&buffer).await?;
        file.flush().await?;

        info!(entries = entries.len(), path = %path.as_ref().display(), "Exported audit trail");
        Ok(entries.len())
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

impl SecurityAuditor for AuditTrail {
    fn record(&self, record: AuditRecord) {
        self.append(record);
    }
}

/// Check a sequence of entries, in order, for hash and link consistency.
pub fn verify_chain<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Result<()> {
    let mut previous: Option<&AuditEntry> = None;

    for entry in entries {
        if entry.compute_hash() != entry.hash {
            return Err(AuditError::IntegrityCheckError {
                sequence: entry.sequence,
                reason: "entry hash does not match its contents".to_string(),
            });
        }
        if let Some(prev) = previous {
            if entry.prev_hash != prev.hash || entry.sequence != prev.sequence + 1 {
                return Err(AuditError::IntegrityCheckError {
                    sequence: entry.sequence,
                    reason: "entry is not linked to its predecessor".to_string(),
                });
            }
        } else if entry.sequence == 0 && entry.prev_hash != GENESIS_HASH {
            return Err(AuditError::IntegrityCheckError {
                sequence: 0,
                reason: "first entry is not anchored at genesis".to_string(),
            });
        }
        previous = Some(entry);
    }
    Ok(())
}

fn mirror(entry: &AuditEntry) {
    match entry.outcome {
        AuditOutcome::Denied | AuditOutcome::Rejected => warn!(
            target: "audit",
            sequence = entry.sequence,
            kind = %entry.kind,
            subject = %entry.subject,
            actor = entry.actor.as_deref().unwrap_or("-"),
            action = %entry.action,
            outcome = %entry.outcome,
            data = %entry.data,
            "Audit entry recorded"
        ),
        _ => info!(
            target: "audit",
            sequence = entry.sequence,
            kind = %entry.kind,
            subject = %entry.subject,
            actor = entry.actor.as_deref().unwrap_or("-"),
            action = %entry.action,
            outcome = %entry.outcome,
            data = %entry.data,
            "Audit entry recorded"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(subject: &str, granted: bool) -> AuditRecord {
        AuditRecord::permission_decision(subject, granted, json!({"resource": "/tmp/x"}))
    }

    #[test]
    fn test_append_assigns_increasing_sequences() {
        let trail = AuditTrail::default();
        assert_eq!(trail.append(record("p1", true)), 0);
        assert_eq!(trail.append(record("p1", false)), 1);
        assert_eq!(trail.len(), 2);
        trail.verify_integrity().unwrap();
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let trail = AuditTrail::default();
        trail.append(record("p1", false));
        trail.append(record("p2", true));

        let mut entries = trail.entries();
        entries[0].outcome = AuditOutcome::Granted;

        let err = verify_chain(entries.iter()).unwrap_err();
        assert!(matches!(err, AuditError::IntegrityCheckError { sequence: 0, .. }));
    }

    #[test]
    fn test_shifting_bytes_between_fields_fails_verification() {
        let trail = AuditTrail::default();
        trail.append(AuditRecord::new(
            AuditEventKind::PolicyChange,
            "ab",
            "c",
            AuditOutcome::Applied,
        ));

        let mut entries = trail.entries();
        entries[0].subject = "a".to_string();
        entries[0].action = "bc".to_string();

        let err = verify_chain(entries.iter()).unwrap_err();
        assert!(matches!(err, AuditError::IntegrityCheckError { sequence: 0, .. }));
    }

    #[test]
    fn test_missing_and_empty_actor_hash_differently() {
        let trail = AuditTrail::default();
        trail.append(record("p1", true));

        let mut entries = trail.entries();
        entries[0].actor = Some(String::new());

        assert!(verify_chain(entries.iter()).is_err());
    }

    #[test]
    fn test_removed_entry_breaks_chain() {
        let trail = AuditTrail::default();
        for i in 0..3 {
            trail.append(record(&format!("p{i}"), true));
        }

        let mut entries = trail.entries();
        entries.remove(1);

        let err = verify_chain(entries.iter()).unwrap_err();
        assert!(matches!(err, AuditError::IntegrityCheckError { sequence: 2, .. }));
    }

    #[test]
    fn test_retention_keeps_newest_and_stays_verifiable() {
        let trail = AuditTrail::new(AuditConfig {
            max_entries: 3,
            mirror_to_tracing: false,
        });
        for i in 0..5 {
            trail.append(record(&format!("p{i}"), true));
        }

        let entries = trail.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 2);
        trail.verify_integrity().unwrap();
    }

    #[test]
    fn test_query_filters_conjunctively() {
        let trail = AuditTrail::default();
        trail.append(record("p1", true));
        trail.append(record("p1", false));
        trail.append(record("p2", false));
        trail.append(AuditRecord::violation("p1", "file:/etc/passwd", json!({})));

        let denied_p1 = trail.query(
            &AuditQuery::new()
                .subject("p1")
                .kind(AuditEventKind::PermissionDecision)
                .outcome(AuditOutcome::Denied),
        );
        assert_eq!(denied_p1.len(), 1);
        assert_eq!(trail.query(&AuditQuery::new().kind(AuditEventKind::Violation)).len(), 1);
    }

    #[tokio::test]
    async fn test_export_jsonl_round_trips_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let trail = AuditTrail::default();
        trail.append(record("p1", true));
        trail.append(record("p1", false).with_actor("operator-7"));

        assert_eq!(trail.export_jsonl(&path).await.unwrap(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let restored: Vec<AuditEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[1].actor.as_deref(), Some("operator-7"));
        verify_chain(restored.iter()).unwrap();
    }
}
