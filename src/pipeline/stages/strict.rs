use std::sync::Arc;

use serde_json::{Map, Value};

use crate::models::{
    HealthDataRecord, UploadFieldDefinition, UploadFieldType, ValidationStrictness,
};
use crate::pipeline::canon::{canonicalize, validate_multi_choice_answers, CanonicalizationResult};
use crate::pipeline::context::UploadContext;
use crate::pipeline::manifest::Manifest;
use crate::pipeline::StageError;
use crate::store::SchemaCatalog;

use super::UploadStage;

/// Strict schema validation: canonicalizes every field of the record data
/// (writing canonical values back), checks required fields and multi-choice
/// answers, and applies the study's configured strictness.
///
/// Legacy studies predate required fields, so validation stays lenient by
/// default: errors are always logged and messaged, but only `Strict` studies
/// abort the upload, and `Report` studies write the combined error text into
/// the record instead.
pub struct StrictValidationStage {
    catalog: Arc<dyn SchemaCatalog>,
}

impl StrictValidationStage {
    pub fn new(catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { catalog }
    }
}

impl UploadStage for StrictValidationStage {
    fn name(&self) -> &str {
        "StrictValidationStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let mut record = ctx.record.take().ok_or_else(|| {
            StageError::validation("record not initialized; format handler did not run")
        })?;

        let result = self.run(ctx, &mut record);
        ctx.record = Some(record);
        result
    }
}

impl StrictValidationStage {
    fn run(&self, ctx: &mut UploadContext, record: &mut HealthDataRecord) -> Result<(), StageError> {
        let schema_id = record
            .schema_id
            .clone()
            .ok_or_else(|| StageError::validation("record has no schema id to validate against"))?;
        let schema_rev = record
            .schema_revision
            .ok_or_else(|| StageError::validation("record has no schema revision"))?;

        let schema = self
            .catalog
            .get_schema(&ctx.study().id, &schema_id, schema_rev)?;

        // Per-field app-version bounds compare against the uploading app's
        // build number, recovered from the manifest we stored as metadata.
        let app_build = Manifest::new(record.metadata.clone()).app_build_number();

        let (errors, notes) =
            validate_all_fields(&schema.field_definitions, record.data_object_mut(), app_build);

        for note in notes {
            ctx.add_message(note);
        }
        if errors.is_empty() {
            return Ok(());
        }

        for error in &errors {
            ctx.add_message(error.clone());
        }

        let combined = errors.join("; ");
        let logged = format!(
            "Strict upload validation error in study {}, schema {}-v{}, upload {}: {}",
            ctx.study().id,
            schema_id,
            schema_rev,
            ctx.upload_id(),
            combined
        );
        tracing::warn!("{logged}");

        match ctx.study().strictness {
            ValidationStrictness::Warning => Ok(()),
            ValidationStrictness::Report => {
                record.validation_errors = Some(combined);
                Ok(())
            }
            ValidationStrictness::Strict => Err(StageError::validation(logged)),
        }
    }
}

/// Walk the field definitions, canonicalize, and collect errors. Returns
/// (errors, notes); notes are informational messages that never count
/// against validity (app-version skips).
fn validate_all_fields(
    field_defs: &[UploadFieldDefinition],
    data_map: &mut Map<String, Value>,
    app_build: Option<i32>,
) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut notes = Vec::new();

    for field_def in field_defs {
        let field_name = &field_def.name;

        if outside_app_version_bounds(field_def, app_build) {
            notes.push(format!(
                "Field {field_name} skipped: outside app version bounds"
            ));
            continue;
        }

        if field_def.field_type.is_attachment() {
            // Attachments export as raw files; presence is all we check.
            let present = data_map.get(field_name).is_some_and(|v| !v.is_null());
            if field_def.required && !present {
                errors.push(format!("Required attachment field {field_name} missing"));
            }
            continue;
        }

        match data_map.get(field_name).cloned() {
            Some(value) if !value.is_null() => {
                match canonicalize(&value, field_def.field_type) {
                    CanonicalizationResult::Valid(canonical) => {
                        if field_def.field_type == UploadFieldType::MultiChoice {
                            errors.extend(validate_multi_choice_answers(field_def, &canonical));
                        }
                        // Write the canonicalization back into the data map.
                        data_map.insert(field_name.clone(), canonical);
                    }
                    CanonicalizationResult::Invalid(message) => {
                        errors.push(format!(
                            "Canonicalization failed for field {field_name}: {message}"
                        ));
                    }
                }
            }
            _ => {
                if field_def.required {
                    errors.push(format!("Required field {field_name} missing"));
                }
            }
        }
    }

    (errors, notes)
}

fn outside_app_version_bounds(field_def: &UploadFieldDefinition, app_build: Option<i32>) -> bool {
    let Some(build) = app_build else {
        // Unknown app version: validate everything.
        return false;
    };
    field_def.min_app_version.is_some_and(|min| build < min)
        || field_def.max_app_version.is_some_and(|max| build > max)
}
