//! Outcome records, the shared result cache, and batch construction.
//!
//! Two writers feed the cache: the response observer (authoritative, derived
//! from the captured network payload) and the task runner (fallback, derived
//! from the click-loop summary or absence of execution). Fallback writes never
//! overwrite an existing entry.

use chrono::Local;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Wall-clock stamp in the collector's format.
pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Final status of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    NotExecuted,
}

/// One target's outcome, as uploaded to the collector.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutcomeRecord {
    pub task_id: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub observed_at: String,
    pub device_name: String,
}

impl OutcomeRecord {
    /// Authoritative record derived from a captured reward-submission response.
    pub fn observed(
        task_id: &str,
        code: Option<i64>,
        message: Option<String>,
        device_name: &str,
    ) -> Self {
        let status = if code == Some(0) {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Failure
        };
        Self {
            task_id: task_id.to_string(),
            status,
            response_code: code,
            message,
            observed_at: now_stamp(),
            device_name: device_name.to_string(),
        }
    }

    /// Fallback record synthesized from the click loop or its failure.
    pub fn fallback(task_id: &str, status: OutcomeStatus, message: String, device_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            response_code: None,
            message: Some(message),
            observed_at: now_stamp(),
            device_name: device_name.to_string(),
        }
    }

    /// Record for a target that was selected but never executed.
    pub fn not_executed(task_id: &str, device_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: OutcomeStatus::NotExecuted,
            response_code: None,
            message: None,
            observed_at: now_stamp(),
            device_name: device_name.to_string(),
        }
    }
}

/// Shared `task_id -> OutcomeRecord` map.
#[derive(Default)]
pub struct ResultCache {
    records: DashMap<String, OutcomeRecord>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer write: overwrites any prior fallback entry for the target.
    pub fn insert_observed(&self, record: OutcomeRecord) {
        self.records.insert(record.task_id.clone(), record);
    }

    /// Fallback write: only fills a vacant slot. Returns whether it was written.
    ///
    /// Authority is decided by cache membership, not timestamps, so an
    /// observer record captured at any point during the run always wins.
    pub fn insert_fallback(&self, record: OutcomeRecord) -> bool {
        match self.records.entry(record.task_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.records.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<OutcomeRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stable snapshot, sorted by task id so batches are deterministic.
    pub fn snapshot(&self) -> Vec<OutcomeRecord> {
        let mut records: Vec<OutcomeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// Insert a `not_executed` record for every selected target the run never
/// produced a result for. Idempotent: existing entries are never touched.
pub fn finalize(cache: &ResultCache, selected: &[String], device_name: &str) {
    for task_id in selected {
        cache.insert_fallback(OutcomeRecord::not_executed(task_id, device_name));
    }
}

/// One upload attempt's payload, snapshotted from the cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UploadBatch {
    pub device_name: String,
    pub total_tasks: usize,
    pub results: Vec<OutcomeRecord>,
    pub upload_time: String,
}

impl UploadBatch {
    pub fn from_cache(cache: &ResultCache, device_name: &str) -> Self {
        let results = cache.snapshot();
        Self {
            device_name: device_name.to_string(),
            total_tasks: results.len(),
            results,
            upload_time: now_stamp(),
        }
    }
}
