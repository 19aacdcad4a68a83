//! Immutable append-only operation log with SHA-256 chain hashing.
//!
//! Every mutating operation against an instance (create, delete, start,
//! stop, repair step, backup, restore, config edit) is recorded here
//! before its side effect executes. Records are cryptographically
//! chained — tampering with any record breaks the chain.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use sbo_persist::JsonStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    CreateInstance,
    StartInstance,
    StopInstance,
    DeleteInstance,
    RunRepair,
    RepairStepCompleted,
    TakeBackup,
    RestoreBackup,
    EditConfig,
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            serde_json::to_value(self)
                .unwrap_or_default()
                .as_str()
                .unwrap_or("unknown")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: OperationAction,
    pub instance_id: String,
    pub parameters: serde_json::Value,
    pub result: OperationResult,
    pub previous_hash: String,
    pub record_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

pub struct OperationLog {
    records: HashMap<String, OperationRecord>,
    store: JsonStore,
    last_hash: String,
}

impl OperationLog {
    /// Create or load the operation log from disk.
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "operation_log");
        let records: HashMap<String, OperationRecord> = store.load();

        let last_hash = records
            .values()
            .max_by_key(|r| r.timestamp)
            .map(|r| r.record_hash.clone())
            .unwrap_or_default();

        info!(record_count = records.len(), "operation log initialized");
        Self { records, store, last_hash }
    }

    /// Append a new record. Call this before executing the mutating
    /// side-effect it describes. Returns the record hash.
    pub fn append(
        &mut self,
        action: OperationAction,
        instance_id: &str,
        parameters: serde_json::Value,
        result: OperationResult,
    ) -> String {
        let record_id = Uuid::new_v4();
        let timestamp = Utc::now();

        let canonical = serde_json::json!({
            "record_id": record_id,
            "timestamp": timestamp,
            "action": action,
            "instance_id": instance_id,
            "parameters": parameters,
            "result": result,
            "previous_hash": self.last_hash,
        });
        let record_hash = sha256_hex(&canonical.to_string());

        let record = OperationRecord {
            record_id,
            timestamp,
            action,
            instance_id: instance_id.to_string(),
            parameters,
            result,
            previous_hash: self.last_hash.clone(),
            record_hash: record_hash.clone(),
        };

        info!(record_id = %record_id, action = %action, instance_id, "operation recorded");

        self.last_hash = record_hash.clone();
        self.records.insert(record_id.to_string(), record);
        self.snapshot();

        record_hash
    }

    pub fn for_instance(&self, instance_id: &str) -> Vec<&OperationRecord> {
        let mut results: Vec<&OperationRecord> = self
            .records
            .values()
            .filter(|r| r.instance_id == instance_id)
            .collect();
        results.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
        results
    }

    /// `true` iff the chain is intact, `false` if tampered.
    pub fn verify_chain(&self) -> bool {
        let mut sorted: Vec<&OperationRecord> = self.records.values().collect();
        sorted.sort_by_key(|r| r.timestamp);

        let mut prev_hash = String::new();
        for record in sorted {
            if record.previous_hash != prev_hash {
                warn!(record_id = %record.record_id, "operation log chain integrity violation");
                return false;
            }
            prev_hash = record.record_hash.clone();
        }
        true
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot operation log");
        }
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
