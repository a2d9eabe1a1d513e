//! Tamper-evident audit log
//!
//! Every entry carries the SHA-256 digest of its own canonical form and the
//! digest of the entry before it (`"genesis"` for the first). Editing any
//! stored entry breaks the chain at that entry, which [`AuditLog::verify`]
//! detects.
//!
//! All appends go through one mutex so the read-hash-write of the running
//! chain hash is never interleaved.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info};

pub const GENESIS_HASH: &str = "genesis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AgentSpawn,
    AgentAction,
    ToolExecution,
    DataAccess,
    PolicyViolation,
    HumanApproval,
    CostThreshold,
    SecurityEvent,
    ModelSwap,
    ConfigChange,
}

/// One link in the audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor: String,
    pub resource: String,
    pub action: String,
    pub details: Value,
    pub result: String,
    pub metadata: Map<String, Value>,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Digest over every field except `hash`
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hex::encode(hasher.finalize())
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields = Map::new();
        fields.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        fields.insert("event_type".into(), serde_json::to_value(self.event_type).unwrap_or(Value::Null));
        fields.insert("actor".into(), Value::String(self.actor.clone()));
        fields.insert("resource".into(), Value::String(self.resource.clone()));
        fields.insert("action".into(), Value::String(self.action.clone()));
        fields.insert("details".into(), self.details.clone());
        fields.insert("result".into(), Value::String(self.result.clone()));
        fields.insert("metadata".into(), Value::Object(self.metadata.clone()));
        fields.insert("previous_hash".into(), Value::String(self.previous_hash.clone()));

        canonicalize(Value::Object(fields)).to_string().into_bytes()
    }
}

/// Rebuild every object with its keys in sorted order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Why verification stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreak {
    /// `previous_hash` does not match the preceding entry's hash
    Linkage,
    /// Stored hash does not match the recomputed digest
    Digest,
}

/// Result of walking the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Index of the first entry that failed
    pub broken_at: Option<usize>,
    pub reason: Option<ChainBreak>,
}

/// Verified snapshot of the whole log
#[derive(Debug, Clone, Serialize)]
pub struct ChainExport {
    pub chain_valid: bool,
    pub total_entries: usize,
    pub current_hash: String,
    pub entries: Vec<AuditEntry>,
}

struct ChainState {
    entries: Vec<AuditEntry>,
    chain_hash: String,
}

/// Append-only, hash-chained event ledger
pub struct AuditLog {
    state: Mutex<ChainState>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                chain_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    /// Append a successful event with no metadata. Returns the entry hash.
    pub fn append(
        &self,
        event_type: AuditEventType,
        actor: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        details: Value,
    ) -> String {
        self.append_with(event_type, actor, resource, action, details, "success", Map::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_with(
        &self,
        event_type: AuditEventType,
        actor: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        details: Value,
        result: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> String {
        let mut state = self.state.lock();

        let mut entry = AuditEntry {
            timestamp: Utc::now(),
            event_type,
            actor: actor.into(),
            resource: resource.into(),
            action: action.into(),
            details,
            result: result.into(),
            metadata,
            previous_hash: state.chain_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        let hash = entry.hash.clone();

        info!(
            event_type = ?entry.event_type,
            actor = %entry.actor,
            resource = %entry.resource,
            result = %entry.result,
            audit_hash = %hash,
            "Audit event"
        );

        state.entries.push(entry);
        state.chain_hash = hash.clone();
        hash
    }

    /// Check every link and digest. Never panics; `false` means tampering.
    pub fn verify(&self) -> bool {
        self.verify_detailed().valid
    }

    /// Like [`verify`](Self::verify) but also names the first broken entry
    pub fn verify_detailed(&self) -> ChainVerification {
        let state = self.state.lock();
        verify_entries(&state.entries)
    }

    /// The last `limit` entries matching both filters, oldest first
    pub fn query(
        &self,
        event_type: Option<AuditEventType>,
        actor: Option<&str>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let state = self.state.lock();
        let matching: Vec<&AuditEntry> = state
            .entries
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| actor.map_or(true, |a| e.actor == a))
            .collect();

        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn export_chain(&self) -> ChainExport {
        let state = self.state.lock();
        ChainExport {
            chain_valid: verify_entries(&state.entries).valid,
            total_entries: state.entries.len(),
            current_hash: state.chain_hash.clone(),
            entries: state.entries.clone(),
        }
    }

    pub fn current_hash(&self) -> String {
        self.state.lock().chain_hash.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

fn verify_entries(entries: &[AuditEntry]) -> ChainVerification {
    let mut running = GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let reason = if entry.previous_hash != running {
            Some(ChainBreak::Linkage)
        } else if entry.compute_hash() != entry.hash {
            Some(ChainBreak::Digest)
        } else {
            None
        };

        if let Some(reason) = reason {
            error!(
                index,
                timestamp = %entry.timestamp,
                reason = ?reason,
                "Audit chain integrity violation"
            );
            return ChainVerification {
                valid: false,
                broken_at: Some(index),
                reason: Some(reason),
            };
        }
        running = entry.hash.as_str();
    }

    ChainVerification {
        valid: true,
        broken_at: None,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn log_three() -> AuditLog {
        let log = AuditLog::new();
        log.append(AuditEventType::AgentSpawn, "orchestrator", "a1", "spawn", json!({"n": 1}));
        log.append(AuditEventType::AgentAction, "a1", "task", "execute", json!({"n": 2}));
        log.append(AuditEventType::AgentAction, "a2", "task", "execute", json!({"n": 3}));
        log
    }

    // === Append Tests ===

    #[test]
    fn test_first_entry_links_to_genesis() {
        let log = AuditLog::new();
        let hash = log.append(AuditEventType::ConfigChange, "admin", "config", "update", json!({}));

        let entries = log.query(None, None, 10);
        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        assert_eq!(entries[0].hash, hash);
        assert_eq!(entries[0].result, "success");
        assert_eq!(log.current_hash(), hash);
    }

    #[test]
    fn test_entries_link_to_predecessor() {
        let log = log_three();
        let entries = log.query(None, None, 10);
        assert_eq!(entries[1].previous_hash, entries[0].hash);
        assert_eq!(entries[2].previous_hash, entries[1].hash);
        assert_eq!(entries[0].hash.len(), 64);
    }

    #[test]
    fn test_hash_is_independent_of_key_order() {
        let log = AuditLog::new();
        log.append(AuditEventType::DataAccess, "a", "r", "read", json!({"b": 1, "a": {"y": 2, "x": 3}}));
        let mut entry = log.query(None, None, 1).remove(0);

        entry.details = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(entry.compute_hash(), entry.hash);
    }

    // === Verification Tests ===

    #[test]
    fn test_verify_empty_and_intact() {
        assert!(AuditLog::new().verify());
        assert!(log_three().verify());
    }

    #[test]
    fn test_tampered_details_detected_at_that_entry() {
        let log = log_three();
        log.state.lock().entries[1].details = json!({"n": 99});

        assert!(!log.verify());
        let report = log.verify_detailed();
        assert_eq!(report.broken_at, Some(1));
        assert_eq!(report.reason, Some(ChainBreak::Digest));
    }

    #[test]
    fn test_sub_microsecond_timestamp_change_detected() {
        let log = log_three();
        log.state.lock().entries[0].timestamp += chrono::Duration::nanoseconds(1);

        let report = log.verify_detailed();
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(0));
        assert_eq!(report.reason, Some(ChainBreak::Digest));
    }

    #[test]
    fn test_rehashed_entry_breaks_linkage_of_next() {
        let log = log_three();
        {
            let mut state = log.state.lock();
            state.entries[1].result = "error".into();
            let rehashed = state.entries[1].compute_hash();
            state.entries[1].hash = rehashed;
        }

        let report = log.verify_detailed();
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(2));
        assert_eq!(report.reason, Some(ChainBreak::Linkage));
    }

    // === Query Tests ===

    #[test]
    fn test_query_filters_then_takes_tail() {
        let log = AuditLog::new();
        for i in 0..5 {
            log.append(AuditEventType::AgentAction, "worker", "task", "execute", json!({"i": i}));
            log.append(AuditEventType::AgentSpawn, "orchestrator", "agent", "spawn", json!({"i": i}));
        }

        let actions = log.query(Some(AuditEventType::AgentAction), None, 2);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].details, json!({"i": 3}));
        assert_eq!(actions[1].details, json!({"i": 4}));

        let spawns = log.query(None, Some("orchestrator"), 100);
        assert_eq!(spawns.len(), 5);

        let none = log.query(Some(AuditEventType::AgentAction), Some("orchestrator"), 100);
        assert!(none.is_empty());
    }

    // === Export Tests ===

    #[test]
    fn test_export_chain() {
        let log = log_three();
        let export = log.export_chain();

        assert!(export.chain_valid);
        assert_eq!(export.total_entries, 3);
        assert_eq!(export.current_hash, export.entries[2].hash);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["chain_valid"], true);
        assert_eq!(json["entries"][0]["event_type"], "agent_spawn");
    }

    // === Concurrency Tests ===

    #[test]
    fn test_concurrent_appends_keep_chain_valid() {
        let log = Arc::new(AuditLog::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.append(AuditEventType::ToolExecution, format!("t{t}"), "tool", "run", json!({"i": i}));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(log.len(), 200);
        assert!(log.verify());
    }
}
