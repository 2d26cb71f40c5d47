use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::models::{HealthDataRecord, Study, Upload};

/// Data read and generated during the validation of one upload.
///
/// One context exists per upload, owned exclusively by the task that runs
/// the pipeline; contexts are never shared across uploads. Each payload slot
/// is populated by exactly one stage and read by later stages — the order is
/// not enforced statically, so stages must check for absence and fail
/// cleanly rather than assume their producer ran.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadContext {
    study: Study,
    upload: Upload,
    success: bool,
    messages: Vec<String>,

    /// Raw archive as received. Shared, never mutated after creation.
    pub raw_archive: Option<Arc<Vec<u8>>>,
    /// Decrypted archive. Created by DecryptStage, read by UnpackStage.
    pub decrypted_archive: Option<Arc<Vec<u8>>>,
    /// Unpacked members by filename. Created by UnpackStage.
    pub file_map: BTreeMap<String, Vec<u8>>,
    /// Members that parsed as JSON. Created by ParseJsonStage.
    pub json_map: BTreeMap<String, Value>,
    /// The record under construction. Created by InitRecordStage, filled in
    /// by the format handler and later stages, persisted by ArtifactsStage.
    pub record: Option<HealthDataRecord>,
    /// Attachment bytes by field name, uploaded by ArtifactsStage.
    pub attachments: BTreeMap<String, Vec<u8>>,
    /// Persisted record id. Created by ArtifactsStage.
    pub record_id: Option<String>,
}

impl UploadContext {
    pub fn new(study: Study, upload: Upload) -> Self {
        Self {
            study,
            upload,
            // Vacuously successful until a stage fails.
            success: true,
            messages: Vec::new(),
            raw_archive: None,
            decrypted_archive: None,
            file_map: BTreeMap::new(),
            json_map: BTreeMap::new(),
            record: None,
            attachments: BTreeMap::new(),
            record_id: None,
        }
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    pub fn upload_id(&self) -> &str {
        &self.upload.id
    }

    pub fn health_code(&self) -> &str {
        &self.upload.health_code
    }

    /// True while no stage has failed. Only the task flips this.
    pub fn success(&self) -> bool {
        self.success
    }

    pub(crate) fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    /// Append a validation message. Messages are append-only and survive to
    /// the final status write; stages use them for every recoverable
    /// anomaly.
    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Copy for shadow testing a candidate stage.
    ///
    /// Every slot a stage might mutate (file/json maps, record, attachments,
    /// messages, record id) is deep-copied, so the candidate can do anything
    /// to the copy without the production context observing it. The bulk
    /// immutable slots (raw and decrypted archive bytes) stay shared behind
    /// `Arc`, keeping the copy cheap for multi-megabyte uploads.
    pub fn shadow_copy(&self) -> UploadContext {
        self.clone()
    }
}
