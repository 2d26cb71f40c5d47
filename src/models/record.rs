use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::enums::SharingScope;

/// The canonical structured output of the pipeline for one upload.
///
/// Built up progressively by the stages: the init stage seeds identity and
/// manifest metadata, the format handler fills in schema identity, createdOn
/// and the data map, the transcribe stage adds consent-derived fields, and
/// the artifacts stage assigns the persisted id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDataRecord {
    /// Assigned by the record store on first persist.
    pub id: Option<String>,
    pub health_code: String,
    pub study_id: String,
    pub schema_id: Option<String>,
    pub schema_revision: Option<i32>,
    pub upload_id: String,
    pub upload_date: NaiveDate,
    /// Millis when validation began, i.e. when the record was created.
    pub uploaded_on: i64,
    /// Millis when the data was measured, per the manifest (or best guess).
    pub created_on: Option<i64>,
    /// Offset string (for example `-07:00`) when the source timestamp
    /// carried one. None when createdOn was recovered from the server clock.
    pub created_on_time_zone: Option<String>,
    /// `appVersion` reported by the uploading app, verbatim.
    pub app_version: Option<String>,
    pub phone_info: Option<String>,
    /// The manifest (`info.json`), verbatim.
    pub metadata: Value,
    /// `metadata.json` contents, when the archive carried one.
    pub user_metadata: Option<Value>,
    /// Field name → canonicalized value. Attachment fields hold reference
    /// tokens after the artifacts stage runs.
    pub data: Value,
    /// Combined validation error text, written when the study strictness is
    /// `Report`.
    pub validation_errors: Option<String>,
    pub user_sharing_scope: Option<SharingScope>,
    pub user_external_id: Option<String>,
    pub user_data_groups: Vec<String>,
}

impl HealthDataRecord {
    pub fn new(
        health_code: impl Into<String>,
        study_id: impl Into<String>,
        upload_id: impl Into<String>,
        upload_date: NaiveDate,
        uploaded_on: i64,
    ) -> Self {
        Self {
            id: None,
            health_code: health_code.into(),
            study_id: study_id.into(),
            schema_id: None,
            schema_revision: None,
            upload_id: upload_id.into(),
            upload_date,
            uploaded_on,
            created_on: None,
            created_on_time_zone: None,
            app_version: None,
            phone_info: None,
            metadata: Value::Object(Map::new()),
            user_metadata: None,
            data: Value::Object(Map::new()),
            validation_errors: None,
            user_sharing_scope: None,
            user_external_id: None,
            user_data_groups: Vec::new(),
        }
    }

    /// The data map as a mutable object. The record always holds an object
    /// here; the accessor exists so stages don't repeat the unwrap dance.
    pub fn data_object_mut(&mut self) -> &mut Map<String, Value> {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        match self.data {
            Value::Object(ref mut map) => map,
            _ => unreachable!("data is reset to an object above"),
        }
    }

    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }

    /// `study:schemaId:revision`, once the format handler has resolved the
    /// schema. None before that.
    pub fn schema_key(&self) -> Option<String> {
        match (&self.schema_id, self.schema_revision) {
            (Some(id), Some(rev)) => Some(format!("{}:{}:{}", self.study_id, id, rev)),
            _ => None,
        }
    }
}
