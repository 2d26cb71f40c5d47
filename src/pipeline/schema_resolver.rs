use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{UploadFieldDefinition, UploadFieldType, UploadSchema};
use crate::store::SchemaCatalog;

use super::canon::{parse_calendar_date, parse_flexible_timestamp, timestamp_from_millis};
use super::manifest::Manifest;
use super::StageError;

/// How to decide which schema an upload belongs to. Selected once by the
/// format handler from the declared/inferred format tag, never re-dispatched
/// mid-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Read schema id + revision (or survey guid + createdOn) directly from
    /// the manifest. `default_revision` is the fallback when the manifest
    /// omits the revision: legacy uploads default to 1, the generic format
    /// requires it and passes None.
    Explicit { default_revision: Option<i32> },
    /// The upload carries non-JSON binary files: match the manifest's item
    /// name against schema *names* and pick the highest revision.
    NonJsonHeuristic,
    /// The upload is all JSON with no usable identifiers: find the schema
    /// whose field set is compatible with the flattened data.
    JsonFieldSetHeuristic,
}

/// Inputs shared by the strategies. `data_fields` is only consulted by the
/// JSON-field-set heuristic: all non-manifest JSON files flattened into one
/// map, keys prefixed by sanitized source filename (`data_json.hr`).
pub struct ResolveInput<'a> {
    pub study_id: &'a str,
    pub manifest: &'a Manifest,
    pub data_fields: &'a BTreeMap<String, Value>,
}

/// Resolves which versioned schema an upload's data matches.
pub struct SchemaResolver<'a> {
    catalog: &'a dyn SchemaCatalog,
}

impl<'a> SchemaResolver<'a> {
    pub fn new(catalog: &'a dyn SchemaCatalog) -> Self {
        Self { catalog }
    }

    pub fn resolve(
        &self,
        strategy: ResolutionStrategy,
        input: &ResolveInput<'_>,
    ) -> Result<UploadSchema, StageError> {
        match strategy {
            ResolutionStrategy::Explicit { default_revision } => {
                self.resolve_explicit(input, default_revision)
            }
            ResolutionStrategy::NonJsonHeuristic => self.resolve_non_json(input),
            ResolutionStrategy::JsonFieldSetHeuristic => self.resolve_json_field_set(input),
        }
    }

    fn resolve_explicit(
        &self,
        input: &ResolveInput<'_>,
        default_revision: Option<i32>,
    ) -> Result<UploadSchema, StageError> {
        let manifest = input.manifest;

        // Survey reference takes priority when both halves are present.
        if let (Some(guid), Some(created_on)) = (manifest.survey_guid(), manifest.survey_created_on())
        {
            return self.resolve_by_survey(input.study_id, guid, created_on);
        }

        // Fall back to the item field, then to the non-standard identifier
        // alias some old builds send.
        let item = manifest.item().or_else(|| {
            let identifier = manifest.identifier();
            if let Some(id) = identifier {
                tracing::warn!(
                    identifier = %id,
                    "info.json missing item field, falling back to identifier field"
                );
            }
            identifier
        });

        match item {
            Some(item) => {
                let revision = manifest
                    .schema_revision()
                    .or(default_revision)
                    .ok_or_else(|| {
                        StageError::validation(
                            "info.json must contain either item and schemaRevision or surveyGuid \
                             and surveyCreatedOn",
                        )
                    })?;
                Ok(self.catalog.get_schema(input.study_id, item, revision)?)
            }
            None if default_revision.is_some() => Err(StageError::validation(
                "info.json must contain either item or surveyGuid and surveyCreatedOn",
            )),
            None => Err(StageError::validation(
                "info.json must contain either item and schemaRevision or surveyGuid and \
                 surveyCreatedOn",
            )),
        }
    }

    fn resolve_by_survey(
        &self,
        study_id: &str,
        guid: &str,
        created_on: &str,
    ) -> Result<UploadSchema, StageError> {
        // surveyCreatedOn is a timestamp; the catalog keys surveys by epoch
        // millis.
        let created_on_millis = parse_flexible_timestamp(created_on)
            .map(|ts| ts.timestamp_millis())
            .ok_or_else(|| {
                StageError::validation(format!("Invalid surveyCreatedOn {created_on}"))
            })?;

        let survey = self.catalog.get_survey(study_id, guid, created_on_millis)?;

        // The survey identifier is the schema id; both it and the revision
        // must be present on the published survey.
        let (Some(schema_id), Some(revision)) = (survey.identifier, survey.schema_revision) else {
            return Err(StageError::validation(format!(
                "Schema not found for survey {guid}:{created_on_millis}"
            )));
        };

        Ok(self.catalog.get_schema(study_id, &schema_id, revision)?)
    }

    fn resolve_non_json(&self, input: &ResolveInput<'_>) -> Result<UploadSchema, StageError> {
        let Some(item) = input.manifest.item() else {
            return Err(StageError::validation(
                "info.json in non-JSON upload has blank \"item\" field to identify the schema with.",
            ));
        };

        // Parsing unknown binary data is an exercise in madness; the best
        // signal is the item name against registered schema names, highest
        // revision wins.
        let schema_list = self.catalog.get_schemas_for_study(input.study_id)?;
        let latest = schema_list
            .into_iter()
            .filter(|schema| schema.name == item)
            .max_by_key(|schema| schema.revision);

        let Some(schema) = latest else {
            return Err(StageError::validation(format!("No schema found for item {item}")));
        };

        if schema.field_definitions.is_empty() {
            return Err(StageError::validation(format!(
                "Identified schema ID {} rev {} has no fields",
                schema.schema_id, schema.revision
            )));
        }

        Ok(schema)
    }

    fn resolve_json_field_set(&self, input: &ResolveInput<'_>) -> Result<UploadSchema, StageError> {
        let data_fields = input.data_fields;
        let schema_list = self.catalog.get_schemas_for_study(input.study_id)?;

        let mut latest: Option<UploadSchema> = None;
        for schema in schema_list {
            if !schema_matches_field_set(&schema, data_fields) {
                continue;
            }
            // More than one compatible schema: the highest revision is the
            // newest, take it.
            let newer = latest
                .as_ref()
                .map_or(true, |best| schema.revision > best.revision);
            if newer {
                latest = Some(schema);
            }
        }

        latest.ok_or_else(|| {
            let keys: Vec<&str> = data_fields.keys().map(String::as_str).collect();
            StageError::validation(format!("No schema found for keys ({})", keys.join(", ")))
        })
    }
}

/// Field-by-field compatibility between a schema and the flattened data.
/// The strategy is to assume a match until a field disproves it, then check
/// that the data has no keys outside the schema's field-name set.
fn schema_matches_field_set(
    schema: &UploadSchema,
    data_fields: &BTreeMap<String, Value>,
) -> bool {
    // A schema with no fields at all can't be positively identified.
    if schema.field_definitions.is_empty() {
        return false;
    }

    for field_def in &schema.field_definitions {
        match data_fields.get(&field_def.name) {
            None => {
                if field_def.required {
                    return false;
                }
            }
            Some(value) => {
                if !is_field_compatible(field_def, value) {
                    return false;
                }
            }
        }
    }

    // Keys outside the schema's field set mean a different schema (or a
    // different revision of this one).
    data_fields
        .keys()
        .all(|key| schema.field_definitions.iter().any(|f| &f.name == key))
}

/// Whether a declared field type accepts the JSON value's shape.
fn is_field_compatible(field_def: &UploadFieldDefinition, value: &Value) -> bool {
    match field_def.field_type {
        // Binary attachments expect non-JSON data, which never mixes into a
        // JSON upload.
        UploadFieldType::AttachmentBlob
        | UploadFieldType::AttachmentCsv
        | UploadFieldType::LargeTextAttachment => false,
        // JSON blobs are always JSON blobs.
        UploadFieldType::AttachmentJsonBlob | UploadFieldType::InlineJsonBlob => true,
        UploadFieldType::AttachmentJsonTable => match value.as_array() {
            // The outermost layer must be an array, and its first element,
            // if present, an object.
            Some(rows) => rows.first().map_or(true, Value::is_object),
            None => false,
        },
        UploadFieldType::Boolean => value.is_boolean(),
        UploadFieldType::CalendarDate => value
            .as_str()
            .is_some_and(|s| parse_calendar_date(s).is_some()),
        // Strictly floating-point here: an int-shaped value more likely
        // belongs to an int field of some other schema.
        UploadFieldType::Float => value.is_f64(),
        UploadFieldType::Int => value.is_i64() || value.is_u64(),
        UploadFieldType::String => value.is_string(),
        UploadFieldType::SingleChoice => {
            value.is_string() || value.as_array().is_some_and(|arr| arr.len() == 1)
        }
        UploadFieldType::MultiChoice => value.is_array(),
        UploadFieldType::Timestamp => {
            if let Some(text) = value.as_str() {
                parse_flexible_timestamp(text).is_some()
            } else if let Some(millis) = value.as_i64() {
                timestamp_from_millis(millis).is_some()
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Survey, UploadSchemaType};
    use crate::store::InMemorySchemaCatalog;
    use serde_json::json;

    const STUDY: &str = "cardio-flex";

    fn schema(id: &str, rev: i32, fields: Vec<UploadFieldDefinition>) -> UploadSchema {
        UploadSchema::new(STUDY, id, rev, id, UploadSchemaType::LegacyData).with_fields(fields)
    }

    fn resolve_with(
        catalog: &InMemorySchemaCatalog,
        strategy: ResolutionStrategy,
        manifest: Value,
        data_fields: BTreeMap<String, Value>,
    ) -> Result<UploadSchema, StageError> {
        let manifest = Manifest::new(manifest);
        let input = ResolveInput {
            study_id: STUDY,
            manifest: &manifest,
            data_fields: &data_fields,
        };
        SchemaResolver::new(catalog).resolve(strategy, &input)
    }

    // -- Explicit strategy ---------------------------------------------------

    #[test]
    fn explicit_by_item_and_revision() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("daily-survey", 2, vec![]));

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: None },
            json!({"item": "daily-survey", "schemaRevision": 2}),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(found.schema_id, "daily-survey");
        assert_eq!(found.revision, 2);
    }

    #[test]
    fn explicit_missing_revision_without_default_fails() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("daily-survey", 1, vec![]));

        let err = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: None },
            json!({"item": "daily-survey"}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("schemaRevision"));
    }

    #[test]
    fn explicit_missing_revision_defaults_for_legacy() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("daily-survey", 1, vec![]));

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: Some(1) },
            json!({"item": "daily-survey"}),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(found.revision, 1);
    }

    #[test]
    fn explicit_identifier_alias() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("daily-survey", 1, vec![]));

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: Some(1) },
            json!({"identifier": "daily-survey"}),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(found.schema_id, "daily-survey");
    }

    #[test]
    fn explicit_no_identifiers_at_all() {
        let catalog = InMemorySchemaCatalog::new();
        let err = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: Some(1) },
            json!({}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("info.json must contain"));
    }

    #[test]
    fn explicit_by_survey_reference() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("daily-survey", 3, vec![]));
        catalog.put_survey(
            STUDY,
            Survey {
                guid: "guid-1".into(),
                created_on: 1714996800000,
                identifier: Some("daily-survey".into()),
                schema_revision: Some(3),
            },
        );

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: None },
            json!({"surveyGuid": "guid-1", "surveyCreatedOn": "2024-05-06T12:00:00.000Z"}),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(found.revision, 3);
    }

    #[test]
    fn survey_without_published_schema_fails() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_survey(
            STUDY,
            Survey {
                guid: "guid-1".into(),
                created_on: 1714996800000,
                identifier: None,
                schema_revision: None,
            },
        );

        let err = resolve_with(
            &catalog,
            ResolutionStrategy::Explicit { default_revision: None },
            json!({"surveyGuid": "guid-1", "surveyCreatedOn": "2024-05-06T12:00:00.000Z"}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Schema not found for survey"));
    }

    // -- Non-JSON heuristic --------------------------------------------------

    #[test]
    fn non_json_matches_name_highest_revision() {
        let catalog = InMemorySchemaCatalog::new();
        let attachment = |rev| {
            schema(
                "walk-test-data",
                rev,
                vec![UploadFieldDefinition::new("audio", UploadFieldType::AttachmentBlob)],
            )
        };
        let mut v1 = attachment(1);
        v1.name = "Walk Test".into();
        let mut v2 = attachment(2);
        v2.name = "Walk Test".into();
        catalog.put_schema(v1);
        catalog.put_schema(v2);

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::NonJsonHeuristic,
            json!({"item": "Walk Test"}),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(found.revision, 2);
    }

    #[test]
    fn non_json_no_name_match() {
        let catalog = InMemorySchemaCatalog::new();
        let err = resolve_with(
            &catalog,
            ResolutionStrategy::NonJsonHeuristic,
            json!({"item": "Unknown Task"}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("No schema found for item"));
    }

    #[test]
    fn non_json_zero_field_schema_rejected() {
        let catalog = InMemorySchemaCatalog::new();
        let mut empty = schema("walk-test-data", 1, vec![]);
        empty.name = "Walk Test".into();
        catalog.put_schema(empty);

        let err = resolve_with(
            &catalog,
            ResolutionStrategy::NonJsonHeuristic,
            json!({"item": "Walk Test"}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no fields"));
    }

    #[test]
    fn non_json_blank_item_fails() {
        let catalog = InMemorySchemaCatalog::new();
        let err = resolve_with(
            &catalog,
            ResolutionStrategy::NonJsonHeuristic,
            json!({}),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("blank \"item\" field"));
    }

    // -- JSON field-set heuristic --------------------------------------------

    fn vitals_schema(rev: i32) -> UploadSchema {
        schema(
            "vitals",
            rev,
            vec![
                UploadFieldDefinition::new("data_json.hr", UploadFieldType::Int),
                UploadFieldDefinition::new("data_json.note", UploadFieldType::String).optional(),
            ],
        )
    }

    fn vitals_data() -> BTreeMap<String, Value> {
        [
            ("data_json.hr".to_string(), json!(72)),
            ("data_json.note".to_string(), json!("resting")),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn field_set_matches_highest_revision() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(1));
        catalog.put_schema(vitals_schema(2));

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            vitals_data(),
        )
        .unwrap();
        assert_eq!(found.schema_id, "vitals");
        assert_eq!(found.revision, 2);
    }

    #[test]
    fn field_set_resolution_is_deterministic() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(2));
        catalog.put_schema(vitals_schema(1));

        for _ in 0..5 {
            let found = resolve_with(
                &catalog,
                ResolutionStrategy::JsonFieldSetHeuristic,
                json!({}),
                vitals_data(),
            )
            .unwrap();
            assert_eq!((found.schema_id.as_str(), found.revision), ("vitals", 2));
        }
    }

    #[test]
    fn field_set_rejects_extraneous_keys() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(1));

        let mut data = vitals_data();
        data.insert("data_json.extra".into(), json!(1));

        let err = resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            data,
        )
        .unwrap_err();
        assert!(err.to_string().contains("No schema found for keys"));
    }

    #[test]
    fn field_set_rejects_missing_required() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(1));

        let data: BTreeMap<String, Value> =
            [("data_json.note".to_string(), json!("resting"))].into_iter().collect();

        assert!(resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            data,
        )
        .is_err());
    }

    #[test]
    fn field_set_tolerates_missing_optional() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(1));

        let data: BTreeMap<String, Value> =
            [("data_json.hr".to_string(), json!(72))].into_iter().collect();

        let found = resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            data,
        )
        .unwrap();
        assert_eq!(found.schema_id, "vitals");
    }

    #[test]
    fn field_set_type_mismatch_rejects() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(vitals_schema(1));

        let data: BTreeMap<String, Value> = [
            ("data_json.hr".to_string(), json!("seventy-two")),
            ("data_json.note".to_string(), json!("resting")),
        ]
        .into_iter()
        .collect();

        assert!(resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            data,
        )
        .is_err());
    }

    #[test]
    fn zero_field_schemas_never_match() {
        let catalog = InMemorySchemaCatalog::new();
        catalog.put_schema(schema("empty", 1, vec![]));

        assert!(resolve_with(
            &catalog,
            ResolutionStrategy::JsonFieldSetHeuristic,
            json!({}),
            BTreeMap::new(),
        )
        .is_err());
    }

    // -- Shape compatibility -------------------------------------------------

    #[test]
    fn shape_checks_per_type() {
        let field = |ty| UploadFieldDefinition::new("f", ty);

        assert!(!is_field_compatible(&field(UploadFieldType::AttachmentBlob), &json!({})));
        assert!(!is_field_compatible(&field(UploadFieldType::AttachmentCsv), &json!("csv")));
        assert!(is_field_compatible(&field(UploadFieldType::AttachmentJsonBlob), &json!({"a": 1})));
        assert!(is_field_compatible(
            &field(UploadFieldType::AttachmentJsonTable),
            &json!([{"row": 1}])
        ));
        assert!(is_field_compatible(&field(UploadFieldType::AttachmentJsonTable), &json!([])));
        assert!(!is_field_compatible(&field(UploadFieldType::AttachmentJsonTable), &json!([1, 2])));
        assert!(is_field_compatible(&field(UploadFieldType::Boolean), &json!(true)));
        assert!(!is_field_compatible(&field(UploadFieldType::Boolean), &json!(1)));
        assert!(is_field_compatible(&field(UploadFieldType::CalendarDate), &json!("2024-05-06")));
        assert!(!is_field_compatible(&field(UploadFieldType::CalendarDate), &json!("yesterday")));
        assert!(is_field_compatible(&field(UploadFieldType::Float), &json!(1.5)));
        assert!(!is_field_compatible(&field(UploadFieldType::Float), &json!(1)));
        assert!(is_field_compatible(&field(UploadFieldType::Int), &json!(1)));
        assert!(!is_field_compatible(&field(UploadFieldType::Int), &json!(1.5)));
        assert!(is_field_compatible(
            &field(UploadFieldType::Timestamp),
            &json!("2024-05-06T12:00:00Z")
        ));
        assert!(is_field_compatible(&field(UploadFieldType::Timestamp), &json!(1714996800000_i64)));
        assert!(!is_field_compatible(&field(UploadFieldType::Timestamp), &json!(true)));
        assert!(is_field_compatible(&field(UploadFieldType::MultiChoice), &json!(["a"])));
        assert!(is_field_compatible(&field(UploadFieldType::SingleChoice), &json!("a")));
        assert!(is_field_compatible(&field(UploadFieldType::SingleChoice), &json!(["a"])));
    }
}
