use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::models::{HealthDataRecord, UploadStatus};

use super::StoreError;

/// Persistence for health data records and upload validation statuses.
pub trait RecordStore: Send + Sync {
    /// Persist the record, assigning an id on first write. Returns the
    /// record id.
    fn create_or_update_record(&self, record: &HealthDataRecord) -> Result<String, StoreError>;

    fn get_record(&self, record_id: &str) -> Result<Option<HealthDataRecord>, StoreError>;

    /// Write the final validation outcome to the upload's durable record.
    fn write_validation_status(
        &self,
        upload_id: &str,
        status: UploadStatus,
        messages: &[String],
        record_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Validation status row, as read back for tests and admin tooling.
#[derive(Debug, Clone)]
pub struct ValidationStatus {
    pub upload_id: String,
    pub status: UploadStatus,
    pub messages: Vec<String>,
    pub record_id: Option<String>,
}

/// In-memory record store for tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, HealthDataRecord>>,
    statuses: Mutex<HashMap<String, ValidationStatus>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_for(&self, upload_id: &str) -> Option<ValidationStatus> {
        self.statuses.lock().unwrap().get(upload_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl RecordStore for MemoryRecordStore {
    fn create_or_update_record(&self, record: &HealthDataRecord) -> Result<String, StoreError> {
        let record_id = record
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut stored = record.clone();
        stored.id = Some(record_id.clone());
        self.records.lock().unwrap().insert(record_id.clone(), stored);
        Ok(record_id)
    }

    fn get_record(&self, record_id: &str) -> Result<Option<HealthDataRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(record_id).cloned())
    }

    fn write_validation_status(
        &self,
        upload_id: &str,
        status: UploadStatus,
        messages: &[String],
        record_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().insert(
            upload_id.to_string(),
            ValidationStatus {
                upload_id: upload_id.to_string(),
                status,
                messages: messages.to_vec(),
                record_id: record_id.map(str::to_string),
            },
        );
        Ok(())
    }
}

/// Record store whose status write always fails. Exercises the
/// log-and-carry-on path in the orchestrator.
#[cfg(test)]
#[derive(Default)]
pub struct StatusWriteFailingStore {
    inner: MemoryRecordStore,
}

#[cfg(test)]
impl RecordStore for StatusWriteFailingStore {
    fn create_or_update_record(&self, record: &HealthDataRecord) -> Result<String, StoreError> {
        self.inner.create_or_update_record(record)
    }

    fn get_record(&self, record_id: &str) -> Result<Option<HealthDataRecord>, StoreError> {
        self.inner.get_record(record_id)
    }

    fn write_validation_status(
        &self,
        _upload_id: &str,
        _status: UploadStatus,
        _messages: &[String],
        _record_id: Option<&str>,
    ) -> Result<(), StoreError> {
        Err(StoreError::RecordNotFound("status table offline".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record() -> HealthDataRecord {
        HealthDataRecord::new(
            "hc-123",
            "cardio-flex",
            "upload-1",
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            1_714_953_600_000,
        )
    }

    #[test]
    fn create_assigns_id_and_update_keeps_it() {
        let store = MemoryRecordStore::new();

        let id = store.create_or_update_record(&record()).unwrap();
        let mut stored = store.get_record(&id).unwrap().unwrap();
        assert_eq!(stored.id.as_deref(), Some(id.as_str()));

        stored.schema_id = Some("daily-survey".into());
        let id2 = store.create_or_update_record(&stored).unwrap();
        assert_eq!(id, id2);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn status_write_round_trip() {
        let store = MemoryRecordStore::new();
        store
            .write_validation_status(
                "upload-1",
                UploadStatus::ValidationFailed,
                &["went wrong".into()],
                None,
            )
            .unwrap();

        let status = store.status_for("upload-1").unwrap();
        assert_eq!(status.status, UploadStatus::ValidationFailed);
        assert_eq!(status.messages, vec!["went wrong".to_string()]);
        assert!(status.record_id.is_none());
    }

    #[test]
    fn missing_record_is_none() {
        let store = MemoryRecordStore::new();
        assert!(store.get_record("nope").unwrap().is_none());
    }
}
