use std::sync::Arc;

use serde_json::Value;

use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;
use crate::store::{BlobStore, RecordStore};

use super::UploadStage;

/// Persists the health data record and uploads the accumulated attachment
/// bytes, rewriting attachment fields to their reference tokens.
///
/// Attachment keys are deterministic (`{uploadId}-{fieldName}`), so a
/// retried upload overwrites the same objects instead of duplicating them.
pub struct ArtifactsStage {
    record_store: Arc<dyn RecordStore>,
    blob_store: Arc<dyn BlobStore>,
    attachment_bucket: String,
}

impl ArtifactsStage {
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        blob_store: Arc<dyn BlobStore>,
        attachment_bucket: impl Into<String>,
    ) -> Self {
        Self {
            record_store,
            blob_store,
            attachment_bucket: attachment_bucket.into(),
        }
    }
}

impl UploadStage for ArtifactsStage {
    fn name(&self) -> &str {
        "ArtifactsStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let mut record = ctx
            .record
            .take()
            .ok_or_else(|| StageError::validation("record not initialized"))?;
        let upload_id = ctx.upload_id().to_string();

        let result: Result<String, StageError> = (|| {
            // Step 1: persist the record.
            let record_id = self.record_store.create_or_update_record(&record)?;
            record.id = Some(record_id.clone());

            // Step 2: upload attachments and point the record at them.
            if !ctx.attachments.is_empty() {
                for (field_name, bytes) in &ctx.attachments {
                    let attachment_key = format!("{upload_id}-{field_name}");
                    self.blob_store
                        .write_bytes(&self.attachment_bucket, &attachment_key, bytes)
                        .map_err(|e| {
                            StageError::validation(format!(
                                "Upload ID {upload_id} error uploading attachment for field \
                                 {field_name}: {e}"
                            ))
                        })?;
                    record
                        .data_object_mut()
                        .insert(field_name.clone(), Value::String(attachment_key));
                }

                // Step 3: re-persist with the attachment references in place.
                self.record_store.create_or_update_record(&record)?;
            }

            Ok(record_id)
        })();

        ctx.record = Some(record);
        let record_id = result?;
        ctx.record_id = Some(record_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthDataRecord, Study, Upload};
    use crate::store::{MemoryBlobStore, MemoryRecordStore};
    use chrono::NaiveDate;
    use serde_json::json;

    const BUCKET: &str = "attachments";

    fn context() -> UploadContext {
        let mut ctx = UploadContext::new(
            Study::new("cardio-flex", "CardioFlex"),
            Upload::new(
                "upload-1",
                "hc-123",
                "archive.tgz",
                NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            ),
        );
        let mut record = HealthDataRecord::new(
            "hc-123",
            "cardio-flex",
            "upload-1",
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            1_714_953_600_000,
        );
        record.schema_id = Some("vitals".into());
        record.schema_revision = Some(1);
        record.data_object_mut().insert("hr".into(), json!(72));
        ctx.record = Some(record);
        ctx
    }

    #[test]
    fn persists_record_without_attachments() {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let stage = ArtifactsStage::new(records.clone(), blobs.clone(), BUCKET);

        let mut ctx = context();
        stage.handle(&mut ctx).unwrap();

        let record_id = ctx.record_id.clone().unwrap();
        let stored = records.get_record(&record_id).unwrap().unwrap();
        assert_eq!(stored.data["hr"], json!(72));
        assert!(blobs.keys(BUCKET).is_empty());
        assert_eq!(records.record_count(), 1);
    }

    #[test]
    fn uploads_attachments_and_rewrites_fields() {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let stage = ArtifactsStage::new(records.clone(), blobs.clone(), BUCKET);

        let mut ctx = context();
        ctx.attachments.insert("motion_data".into(), vec![1, 2, 3]);

        stage.handle(&mut ctx).unwrap();

        let record_id = ctx.record_id.clone().unwrap();
        let stored = records.get_record(&record_id).unwrap().unwrap();
        assert_eq!(stored.data["motion_data"], json!("upload-1-motion_data"));
        assert_eq!(
            blobs.read_bytes(BUCKET, "upload-1-motion_data").unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn missing_record_fails_cleanly() {
        let stage = ArtifactsStage::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryBlobStore::new()),
            BUCKET,
        );
        let mut ctx = context();
        ctx.record = None;

        assert!(stage.handle(&mut ctx).is_err());
        assert!(ctx.record_id.is_none());
    }
}
