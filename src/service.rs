//! Per-upload task spawning. One validation task owns one context and runs
//! to completion; concurrency across uploads is independent tasks on the
//! blocking pool, so no locking exists at the context level.

use std::sync::Arc;

use serde::Serialize;

use crate::archive::{Decryptor, Unpacker};
use crate::config;
use crate::models::{Study, Upload};
use crate::pipeline::context::UploadContext;
use crate::pipeline::stages::{
    ArtifactsStage, DecryptStage, DedupStage, FormatStage, InitRecordStage, ParseJsonStage,
    StrictValidationStage, TranscribeConsentStage, UnpackStage, UploadStage,
};
use crate::pipeline::task::ValidationTask;
use crate::store::{BlobStore, ConsentService, DedupIndex, RecordStore, SchemaCatalog};

/// Summary of one validation run, returned to the caller that enqueued the
/// upload. The durable outcome is in the record store either way.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub success: bool,
    pub record_id: Option<String>,
    pub messages: Vec<String>,
}

/// Wires the collaborators into validation tasks and runs them, one task
/// per upload.
pub struct UploadValidationService {
    decryptor: Arc<dyn Decryptor>,
    unpacker: Arc<dyn Unpacker>,
    catalog: Arc<dyn SchemaCatalog>,
    blob_store: Arc<dyn BlobStore>,
    record_store: Arc<dyn RecordStore>,
    dedup_index: Arc<dyn DedupIndex>,
    consent: Arc<dyn ConsentService>,
    attachment_bucket: String,
}

impl UploadValidationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        decryptor: Arc<dyn Decryptor>,
        unpacker: Arc<dyn Unpacker>,
        catalog: Arc<dyn SchemaCatalog>,
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
        dedup_index: Arc<dyn DedupIndex>,
        consent: Arc<dyn ConsentService>,
    ) -> Self {
        Self {
            decryptor,
            unpacker,
            catalog,
            blob_store,
            record_store,
            dedup_index,
            consent,
            attachment_bucket: config::attachment_bucket(),
        }
    }

    pub fn with_attachment_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.attachment_bucket = bucket.into();
        self
    }

    /// The production stage list, in order.
    fn build_stages(&self) -> Vec<Box<dyn UploadStage>> {
        vec![
            Box::new(DecryptStage::new(self.decryptor.clone())),
            Box::new(UnpackStage::new(self.unpacker.clone())),
            Box::new(ParseJsonStage::new()),
            Box::new(InitRecordStage),
            Box::new(FormatStage::new(
                self.catalog.clone(),
                self.blob_store.clone(),
                self.attachment_bucket.clone(),
            )),
            Box::new(TranscribeConsentStage::new(self.consent.clone())),
            Box::new(StrictValidationStage::new(self.catalog.clone())),
            Box::new(ArtifactsStage::new(
                self.record_store.clone(),
                self.blob_store.clone(),
                self.attachment_bucket.clone(),
            )),
            Box::new(DedupStage::new(self.dedup_index.clone())),
        ]
    }

    /// Build a context for one upload, raw archive bytes attached.
    pub fn create_context(&self, study: Study, upload: Upload, raw_archive: Vec<u8>) -> UploadContext {
        let mut ctx = UploadContext::new(study, upload);
        ctx.raw_archive = Some(Arc::new(raw_archive));
        ctx
    }

    /// Validate one upload synchronously on the calling thread.
    pub fn validate(&self, study: Study, upload: Upload, raw_archive: Vec<u8>) -> UploadOutcome {
        let task = ValidationTask::new(self.build_stages(), self.record_store.clone());
        let mut ctx = self.create_context(study, upload, raw_archive);
        task.run(&mut ctx);

        UploadOutcome {
            upload_id: ctx.upload_id().to_string(),
            success: ctx.success(),
            record_id: ctx.record_id.clone(),
            messages: ctx.messages().to_vec(),
        }
    }

    /// Validate one upload on the blocking pool. Independent uploads run in
    /// parallel, each with its own context and task.
    pub async fn validate_async(
        self: Arc<Self>,
        study: Study,
        upload: Upload,
        raw_archive: Vec<u8>,
    ) -> Result<UploadOutcome, tokio::task::JoinError> {
        tokio::task::spawn_blocking(move || self.validate(study, upload, raw_archive)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{pack, AesGcmDecryptor, TarGzUnpacker};
    use crate::models::{
        UploadFieldDefinition, UploadFieldType, UploadSchema, UploadSchemaType, UploadStatus,
        ValidationStrictness,
    };
    use crate::store::{
        InMemorySchemaCatalog, MemoryBlobStore, MemoryDedupIndex, MemoryRecordStore,
        StaticConsentService,
    };
    use chrono::NaiveDate;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    const STUDY: &str = "cardio-flex";
    const BUCKET: &str = "attachments";
    const STUDY_SECRET: &str = "cardio-flex-archive-secret";

    struct Fixture {
        catalog: Arc<InMemorySchemaCatalog>,
        blob_store: Arc<MemoryBlobStore>,
        record_store: Arc<MemoryRecordStore>,
        dedup_index: Arc<MemoryDedupIndex>,
        service: Arc<UploadValidationService>,
    }

    fn fixture() -> Fixture {
        // Surface pipeline logs when a test is run with GANTRY_LOG set.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .try_init();

        let key = AesGcmDecryptor::derive_key(STUDY_SECRET);
        let catalog = Arc::new(InMemorySchemaCatalog::new());
        let blob_store = Arc::new(MemoryBlobStore::new());
        let record_store = Arc::new(MemoryRecordStore::new());
        let dedup_index = Arc::new(MemoryDedupIndex::new());

        let service = UploadValidationService::new(
            Arc::new(AesGcmDecryptor::new().with_study_key(STUDY, key)),
            Arc::new(TarGzUnpacker::new()),
            catalog.clone(),
            blob_store.clone(),
            record_store.clone(),
            dedup_index.clone(),
            Arc::new(StaticConsentService::new()),
        )
        .with_attachment_bucket(BUCKET);

        Fixture {
            catalog,
            blob_store,
            record_store,
            dedup_index,
            service: Arc::new(service),
        }
    }

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let map: BTreeMap<String, Vec<u8>> = files
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect();
        let packed = pack(&map).unwrap();
        let key = AesGcmDecryptor::derive_key(STUDY_SECRET);
        AesGcmDecryptor::encrypt(&key, &packed).unwrap()
    }

    fn upload(id: &str) -> Upload {
        Upload::new(
            id,
            "hc-123",
            format!("{id}.tgz"),
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        )
    }

    fn survey_schema() -> UploadSchema {
        UploadSchema::new(STUDY, "survey-1", 2, "Survey One", UploadSchemaType::Generic)
            .with_fields(vec![
                UploadFieldDefinition::new("hr", UploadFieldType::Int),
                UploadFieldDefinition::new("mood", UploadFieldType::MultiChoice)
                    .with_answers(&["good", "bad"]),
                UploadFieldDefinition::new("samples", UploadFieldType::AttachmentJsonBlob)
                    .optional(),
            ])
    }

    fn survey_archive() -> Vec<u8> {
        let info = json!({
            "format": "v2_generic",
            "item": "survey-1",
            "schemaRevision": 2,
            "createdOn": "2024-05-06T12:00:00-07:00",
            "dataFilename": "data.json",
            "appVersion": "version 1.0.2, build 7",
            "files": [{"filename": "data.json", "timestamp": "2024-05-06T12:00:00-07:00"}],
        });
        let data = json!({"hr": 72, "mood": ["good"], "samples": [1, 2, 3]});
        archive(&[
            ("info.json", info.to_string().as_bytes()),
            ("data.json", data.to_string().as_bytes()),
        ])
    }

    #[test]
    fn valid_generic_upload_end_to_end() {
        let fixture = fixture();
        fixture.catalog.put_schema(survey_schema());

        let outcome =
            fixture
                .service
                .validate(Study::new(STUDY, "CardioFlex"), upload("upload-1"), survey_archive());

        assert!(outcome.success, "messages: {:?}", outcome.messages);
        let record_id = outcome.record_id.unwrap();
        let record = fixture.record_store.get_record(&record_id).unwrap().unwrap();

        assert_eq!(record.schema_id.as_deref(), Some("survey-1"));
        assert_eq!(record.schema_revision, Some(2));
        assert_eq!(record.data["hr"], json!(72));
        assert_eq!(record.data["mood"], json!(["good"]));
        // Attachment replaced by its deterministic reference token.
        assert_eq!(record.data["samples"], json!("upload-1-samples"));
        assert_eq!(
            fixture.blob_store.read_bytes(BUCKET, "upload-1-samples").unwrap(),
            b"[1,2,3]"
        );
        // Record contains exactly the schema's fields.
        assert_eq!(record.data_object().unwrap().len(), 3);

        let status = fixture.record_store.status_for("upload-1").unwrap();
        assert_eq!(status.status, UploadStatus::Succeeded);
        assert_eq!(status.record_id.as_deref(), Some(record_id.as_str()));
    }

    #[test]
    fn manifest_without_identifiers_fails_validation() {
        let fixture = fixture();
        let info = json!({"format": "v2_generic", "createdOn": "2024-05-06T12:00:00Z"});
        let raw = archive(&[("info.json", info.to_string().as_bytes())]);

        let outcome =
            fixture
                .service
                .validate(Study::new(STUDY, "CardioFlex"), upload("upload-1"), raw);

        assert!(!outcome.success);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.contains("info.json must contain")));
        let status = fixture.record_store.status_for("upload-1").unwrap();
        assert_eq!(status.status, UploadStatus::ValidationFailed);
        assert_eq!(fixture.record_store.record_count(), 0);
    }

    #[test]
    fn invalid_multi_choice_answer_lenient_study_still_writes_record() {
        let fixture = fixture();
        fixture.catalog.put_schema(survey_schema());

        let info = json!({
            "format": "v2_generic",
            "item": "survey-1",
            "schemaRevision": 2,
            "createdOn": "2024-05-06T12:00:00Z",
            "dataFilename": "data.json",
        });
        let data = json!({"hr": 72, "mood": ["meh"]});
        let raw = archive(&[
            ("info.json", info.to_string().as_bytes()),
            ("data.json", data.to_string().as_bytes()),
        ]);

        let outcome =
            fixture
                .service
                .validate(Study::new(STUDY, "CardioFlex"), upload("upload-1"), raw);

        assert!(outcome.success);
        assert!(outcome.messages.iter().any(|m| m.contains("invalid answer meh")));
        assert_eq!(fixture.record_store.record_count(), 1);
    }

    #[test]
    fn invalid_multi_choice_answer_strict_study_aborts() {
        let fixture = fixture();
        fixture.catalog.put_schema(survey_schema());

        let info = json!({
            "format": "v2_generic",
            "item": "survey-1",
            "schemaRevision": 2,
            "createdOn": "2024-05-06T12:00:00Z",
            "dataFilename": "data.json",
        });
        let data = json!({"hr": 72, "mood": ["meh"]});
        let raw = archive(&[
            ("info.json", info.to_string().as_bytes()),
            ("data.json", data.to_string().as_bytes()),
        ]);

        let study =
            Study::new(STUDY, "CardioFlex").with_strictness(ValidationStrictness::Strict);
        let outcome = fixture.service.validate(study, upload("upload-1"), raw);

        assert!(!outcome.success);
        // Strict validation runs before persistence, so no record exists.
        assert_eq!(fixture.record_store.record_count(), 0);
        let status = fixture.record_store.status_for("upload-1").unwrap();
        assert_eq!(status.status, UploadStatus::ValidationFailed);
    }

    #[test]
    fn duplicate_submissions_are_advisory_only() {
        let fixture = fixture();
        fixture.catalog.put_schema(survey_schema());

        let first = fixture.service.validate(
            Study::new(STUDY, "CardioFlex"),
            upload("upload-1"),
            survey_archive(),
        );
        let second = fixture.service.validate(
            Study::new(STUDY, "CardioFlex"),
            upload("upload-2"),
            survey_archive(),
        );

        assert!(first.success);
        assert!(second.success);
        assert!(!first.messages.iter().any(|m| m.contains("duplicate")));
        assert!(second.messages.iter().any(|m| m.contains("duplicate submission")));
        // Both records persisted; dedup never blocks.
        assert_eq!(fixture.record_store.record_count(), 2);

        // Exactly one registration, pointing at the first upload.
        let created_on = chrono::DateTime::parse_from_rfc3339("2024-05-06T12:00:00-07:00")
            .unwrap()
            .timestamp_millis();
        assert_eq!(
            fixture
                .dedup_index
                .registered_upload_id(created_on, "hc-123", "cardio-flex:survey-1:2")
                .as_deref(),
            Some("upload-1")
        );
    }

    #[test]
    fn listed_file_missing_from_archive_is_recoverable() {
        let fixture = fixture();
        fixture.catalog.put_schema(
            UploadSchema::new(STUDY, "tapping", 1, "Tapping", UploadSchemaType::LegacyData)
                .with_fields(vec![UploadFieldDefinition::new(
                    "tapping_json.taps",
                    UploadFieldType::Int,
                )
                .optional()]),
        );

        let info = json!({
            "item": "tapping",
            "files": [
                {"filename": "tapping.json", "timestamp": "2024-05-06T12:00:00Z"},
                {"filename": "missing.json", "timestamp": "2024-05-06T12:00:00Z"},
            ],
        });
        let raw = archive(&[
            ("info.json", info.to_string().as_bytes()),
            ("tapping.json", br#"{"taps": 42}"#),
        ]);

        let outcome =
            fixture
                .service
                .validate(Study::new(STUDY, "CardioFlex"), upload("upload-1"), raw);

        assert!(outcome.success, "messages: {:?}", outcome.messages);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.contains("missing.json") && m.contains("not found in the archive")));
        let record_id = outcome.record_id.unwrap();
        let record = fixture.record_store.get_record(&record_id).unwrap().unwrap();
        assert_eq!(record.data["tapping_json.taps"], json!(42));
    }

    #[test]
    fn garbage_archive_fails_cleanly() {
        let fixture = fixture();
        let outcome = fixture.service.validate(
            Study::new(STUDY, "CardioFlex"),
            upload("upload-1"),
            b"not even encrypted".to_vec(),
        );

        assert!(!outcome.success);
        assert_eq!(
            fixture.record_store.status_for("upload-1").unwrap().status,
            UploadStatus::ValidationFailed
        );
    }

    #[tokio::test]
    async fn uploads_validate_concurrently() {
        let fixture = fixture();
        fixture.catalog.put_schema(survey_schema());

        let task_a = fixture.service.clone().validate_async(
            Study::new(STUDY, "CardioFlex"),
            upload("upload-a"),
            survey_archive(),
        );
        let task_b = fixture.service.clone().validate_async(
            Study::new(STUDY, "CardioFlex"),
            upload("upload-b"),
            survey_archive(),
        );

        let (a, b) = tokio::join!(task_a, task_b);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.success);
        assert!(b.success);
        assert_eq!(fixture.record_store.record_count(), 2);
        assert!(fixture.record_store.status_for("upload-a").is_some());
        assert!(fixture.record_store.status_for("upload-b").is_some());
    }

    #[test]
    fn outcome_serializes_for_the_caller() {
        let outcome = UploadOutcome {
            upload_id: "upload-1".into(),
            success: true,
            record_id: Some("record-1".into()),
            messages: vec!["note".into()],
        };
        let json: Value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["upload_id"], json!("upload-1"));
        assert_eq!(json["success"], json!(true));
    }
}
