use serde::{Deserialize, Serialize};

use super::enums::{UploadFieldType, UploadSchemaType};

/// One typed field of an upload schema.
///
/// Field names double as lookup keys into the archive (whole-file match or
/// `file.key` nested match), so they must be sanitized identifiers:
/// letters, digits, and underscores, not starting with a digit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFieldDefinition {
    pub name: String,
    pub field_type: UploadFieldType,
    pub required: bool,
    /// Valid answers for MultiChoice fields. Empty for every other type.
    pub multi_choice_answer_list: Vec<String>,
    /// When true, MultiChoice answers outside the list are accepted.
    pub allow_other_choices: bool,
    /// Inclusive app build bounds. A field outside the uploading app's build
    /// range is skipped during validation rather than flagged.
    pub min_app_version: Option<i32>,
    pub max_app_version: Option<i32>,
}

impl UploadFieldDefinition {
    pub fn new(name: impl Into<String>, field_type: UploadFieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            multi_choice_answer_list: Vec::new(),
            allow_other_choices: false,
            min_app_version: None,
            max_app_version: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_answers(mut self, answers: &[&str]) -> Self {
        self.multi_choice_answer_list = answers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn allowing_other_choices(mut self) -> Self {
        self.allow_other_choices = true;
        self
    }

    pub fn with_app_version_bounds(mut self, min: Option<i32>, max: Option<i32>) -> Self {
        self.min_app_version = min;
        self.max_app_version = max;
        self
    }
}

/// A versioned, named set of field definitions a study uses to interpret
/// uploads. Immutable per (study, schema_id, revision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSchema {
    pub study_id: String,
    pub schema_id: String,
    pub revision: i32,
    pub name: String,
    pub schema_type: UploadSchemaType,
    pub field_definitions: Vec<UploadFieldDefinition>,
}

impl UploadSchema {
    pub fn new(
        study_id: impl Into<String>,
        schema_id: impl Into<String>,
        revision: i32,
        name: impl Into<String>,
        schema_type: UploadSchemaType,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            schema_id: schema_id.into(),
            revision,
            name: name.into(),
            schema_type,
            field_definitions: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<UploadFieldDefinition>) -> Self {
        self.field_definitions = fields;
        self
    }

    /// The `study:schemaId:revision` triple used by the dedup index.
    pub fn schema_key(&self) -> String {
        format!("{}:{}:{}", self.study_id, self.schema_id, self.revision)
    }
}

/// A published survey. Surveys carry their own identifier plus the revision
/// of the upload schema generated from them; uploads reference surveys by
/// (guid, createdOn) and the pipeline maps that pair back to a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub guid: String,
    pub created_on: i64,
    pub identifier: Option<String>,
    pub schema_revision: Option<i32>,
}
