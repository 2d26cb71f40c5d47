use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{Survey, UploadSchema};

use super::StoreError;

/// Query surface of the schema and survey metadata catalog.
pub trait SchemaCatalog: Send + Sync {
    fn get_schema(
        &self,
        study_id: &str,
        schema_id: &str,
        revision: i32,
    ) -> Result<UploadSchema, StoreError>;

    /// All schemas registered for the study, every revision included.
    fn get_schemas_for_study(&self, study_id: &str) -> Result<Vec<UploadSchema>, StoreError>;

    fn get_survey(
        &self,
        study_id: &str,
        guid: &str,
        created_on_millis: i64,
    ) -> Result<Survey, StoreError>;
}

/// In-memory catalog. Backs tests and small single-node deployments where
/// the schema set is loaded from configuration at startup.
#[derive(Default)]
pub struct InMemorySchemaCatalog {
    schemas: Mutex<HashMap<(String, String, i32), UploadSchema>>,
    surveys: Mutex<HashMap<(String, String, i64), Survey>>,
}

impl InMemorySchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_schema(&self, schema: UploadSchema) {
        let key = (
            schema.study_id.clone(),
            schema.schema_id.clone(),
            schema.revision,
        );
        self.schemas.lock().unwrap().insert(key, schema);
    }

    pub fn put_survey(&self, study_id: impl Into<String>, survey: Survey) {
        let key = (study_id.into(), survey.guid.clone(), survey.created_on);
        self.surveys.lock().unwrap().insert(key, survey);
    }
}

impl SchemaCatalog for InMemorySchemaCatalog {
    fn get_schema(
        &self,
        study_id: &str,
        schema_id: &str,
        revision: i32,
    ) -> Result<UploadSchema, StoreError> {
        self.schemas
            .lock()
            .unwrap()
            .get(&(study_id.to_string(), schema_id.to_string(), revision))
            .cloned()
            .ok_or_else(|| StoreError::SchemaNotFound {
                study_id: study_id.to_string(),
                schema_id: schema_id.to_string(),
                revision,
            })
    }

    fn get_schemas_for_study(&self, study_id: &str) -> Result<Vec<UploadSchema>, StoreError> {
        let schemas = self.schemas.lock().unwrap();
        let mut result: Vec<UploadSchema> = schemas
            .values()
            .filter(|s| s.study_id == study_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.schema_id
                .cmp(&b.schema_id)
                .then(a.revision.cmp(&b.revision))
        });
        Ok(result)
    }

    fn get_survey(
        &self,
        study_id: &str,
        guid: &str,
        created_on_millis: i64,
    ) -> Result<Survey, StoreError> {
        self.surveys
            .lock()
            .unwrap()
            .get(&(study_id.to_string(), guid.to_string(), created_on_millis))
            .cloned()
            .ok_or_else(|| StoreError::SurveyNotFound {
                guid: guid.to_string(),
                created_on: created_on_millis,
            })
    }
}
