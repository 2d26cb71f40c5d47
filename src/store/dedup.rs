use std::collections::HashMap;
use std::sync::Mutex;

use super::StoreError;

/// Write-once index for detecting repeat submissions of logically the same
/// data. Keyed by (createdOn millis, health code, schema key); the value is
/// the first upload id seen for the key.
///
/// The exists-then-register sequence is not atomic; concurrent duplicates of
/// the same key can both register. Dedup is advisory, so that race is
/// accepted.
pub trait DedupIndex: Send + Sync {
    fn exists(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
    ) -> Result<bool, StoreError>;

    fn register(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}

/// In-memory dedup index for tests.
#[derive(Default)]
pub struct MemoryDedupIndex {
    entries: Mutex<HashMap<(i64, String, String), String>>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_upload_id(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
    ) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(&(created_on, health_code.to_string(), schema_key.to_string()))
            .cloned()
    }
}

impl DedupIndex for MemoryDedupIndex {
    fn exists(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .contains_key(&(created_on, health_code.to_string(), schema_key.to_string())))
    }

    fn register(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .entry((created_on, health_code.to_string(), schema_key.to_string()))
            .or_insert_with(|| upload_id.to_string());
        Ok(())
    }
}

/// Dedup index that fails every call. Exercises the swallow-and-log paths.
#[cfg(test)]
pub struct FailingDedupIndex;

#[cfg(test)]
impl DedupIndex for FailingDedupIndex {
    fn exists(&self, _: i64, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::RecordNotFound("dedup index offline".into()))
    }

    fn register(&self, _: i64, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::RecordNotFound("dedup index offline".into()))
    }
}
