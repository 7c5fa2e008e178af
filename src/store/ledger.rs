//! Durable ledgers layered on the staging store: failed pipeline units
//! awaiting resubmission, and published result payloads.

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use crate::models::task::FailedTaskRecord;

use super::{StagingStore, StoreError, CF_FAILED_TASKS, CF_RESULTS};

/// Key prefix for result-ledger records.
pub const RESULT_KEY_PREFIX: &str = "res_";

/// Crash-durable record of failed pipeline units, keyed by task id.
///
/// Stages write here instead of propagating transient errors up to the
/// scheduler; the retry supervisor sweeps and resubmits.
#[derive(Clone)]
pub struct FailureLedger {
    store: Arc<StagingStore>,
}

impl FailureLedger {
    pub fn new(store: Arc<StagingStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, record: &FailedTaskRecord) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_vec(record).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.store
            .put(CF_FAILED_TASKS, &record.task_id.to_string(), &encoded)
    }

    pub fn get(&self, task_id: Uuid) -> Result<Option<FailedTaskRecord>, StoreError> {
        match self.store.get(CF_FAILED_TASKS, &task_id.to_string()) {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
                    cf: CF_FAILED_TASKS,
                    key: task_id.to_string(),
                    message: e.to_string(),
                })?;
                Ok(Some(record))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All decodable ledger entries, in key order. Entries that fail to
    /// decode are left in place and reported at error level so they are
    /// never silently dropped.
    pub fn entries(&self) -> Result<Vec<FailedTaskRecord>, StoreError> {
        let mut records = Vec::new();
        for (key, bytes) in self.store.scan(CF_FAILED_TASKS)? {
            match serde_json::from_slice::<FailedTaskRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(task_id = %key, error = %e, "Undecodable failed-task record, leaving in ledger");
                }
            }
        }
        Ok(records)
    }

    /// Remove one entry. Called only after its resubmission has been
    /// enqueued; a crash between enqueue and delete means the entry is
    /// retried twice, which downstream consolidation tolerates.
    pub fn remove(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.store.delete(CF_FAILED_TASKS, &task_id.to_string())
    }
}

/// Published result payloads keyed by `"res_" + asset_id`. Overwritten on
/// republish.
#[derive(Clone)]
pub struct ResultLedger {
    store: Arc<StagingStore>,
}

impl ResultLedger {
    pub fn new(store: Arc<StagingStore>) -> Self {
        Self { store }
    }

    pub fn result_key(asset_id: &str) -> String {
        format!("{RESULT_KEY_PREFIX}{asset_id}")
    }

    /// Write the result record and return its ledger key.
    pub fn record(&self, asset_id: &str, payload: &serde_json::Value) -> Result<String, StoreError> {
        let key = Self::result_key(asset_id);
        let encoded =
            serde_json::to_vec(payload).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.store.put(CF_RESULTS, &key, &encoded)?;
        Ok(key)
    }

    pub fn get(&self, asset_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let key = Self::result_key(asset_id);
        match self.store.get(CF_RESULTS, &key) {
            Ok(bytes) => {
                let payload = serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
                    cf: CF_RESULTS,
                    key,
                    message: e.to_string(),
                })?;
                Ok(Some(payload))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::Domain;
    use crate::models::task::FailureKind;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, FailureLedger, ResultLedger) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StagingStore::open(tmp.path()).unwrap());
        (
            tmp,
            FailureLedger::new(store.clone()),
            ResultLedger::new(store),
        )
    }

    #[test]
    fn test_failure_record_round_trip() {
        let (_tmp, failures, _) = ledger();
        let record = FailedTaskRecord::new(
            Uuid::new_v4(),
            FailureKind::FaceDetect,
            vec!["img_1.jpg".into(), "img_2.jpg".into()],
            Domain::Face,
            "connection refused",
        );
        failures.record(&record).unwrap();

        let loaded = failures.get(record.task_id).unwrap().unwrap();
        assert_eq!(loaded.kind, FailureKind::FaceDetect);
        assert_eq!(loaded.asset_ids, record.asset_ids);

        failures.remove(record.task_id).unwrap();
        assert!(failures.get(record.task_id).unwrap().is_none());
    }

    #[test]
    fn test_empty_ledger_has_no_entries() {
        let (_tmp, failures, _) = ledger();
        assert!(failures.entries().unwrap().is_empty());
    }

    #[test]
    fn test_result_key_convention() {
        let (_tmp, _, results) = ledger();
        let payload = serde_json::json!({"faces": ["img_1.jpg_0"]});
        let key = results.record("img_1.jpg", &payload).unwrap();
        assert_eq!(key, "res_img_1.jpg");
        assert_eq!(results.get("img_1.jpg").unwrap().unwrap(), payload);
    }

    #[test]
    fn test_result_overwritten_on_republish() {
        let (_tmp, _, results) = ledger();
        results
            .record("img_1.jpg", &serde_json::json!({"texts": []}))
            .unwrap();
        let second = serde_json::json!({"texts": ["hello"]});
        results.record("img_1.jpg", &second).unwrap();
        assert_eq!(results.get("img_1.jpg").unwrap().unwrap(), second);
    }
}
