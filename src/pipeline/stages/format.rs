use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Value};

use crate::config;
use crate::models::{
    HealthDataRecord, UploadFieldDefinition, UploadFieldType, UploadFormat, UploadSchema,
    UploadSchemaType,
};
use crate::pipeline::canon::{offset_string, parse_calendar_date, parse_flexible_timestamp};
use crate::pipeline::context::UploadContext;
use crate::pipeline::field_resolver::{FieldResolver, ParsedJsonCache};
use crate::pipeline::manifest::{
    Manifest, FIELD_ANSWERS, FILENAME_INFO_JSON, FILENAME_METADATA_JSON, UNIT_FIELD_SUFFIX,
};
use crate::pipeline::sanitize::{
    sanitize_field_name, sanitize_keys, strip_filename_timestamp, strip_filename_timestamps,
};
use crate::pipeline::schema_resolver::{ResolutionStrategy, ResolveInput, SchemaResolver};
use crate::pipeline::StageError;
use crate::store::{BlobStore, SchemaCatalog};

use super::UploadStage;

/// Populates the health data record from the decoded upload contents.
///
/// One strategy is selected from the manifest's declared (or inferred)
/// format tag and never re-dispatched mid-flow:
/// - `v2_generic` resolves the schema explicitly (schema or survey
///   reference required) and reads fields schema-driven.
/// - `v1_legacy` with usable identifiers resolves explicitly with a
///   default revision of 1, converting survey answer files when the schema
///   is a survey.
/// - `v1_legacy` without identifiers falls back to the heuristics: schema
///   name matching for single-binary uploads, field-set matching for JSON
///   uploads.
pub struct FormatStage {
    catalog: Arc<dyn SchemaCatalog>,
    blob_store: Arc<dyn BlobStore>,
    attachment_bucket: String,
    data_file_size_limit: u64,
    survey_answer_size_limit: u64,
}

impl FormatStage {
    pub fn new(
        catalog: Arc<dyn SchemaCatalog>,
        blob_store: Arc<dyn BlobStore>,
        attachment_bucket: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            blob_store,
            attachment_bucket: attachment_bucket.into(),
            data_file_size_limit: config::FILE_SIZE_LIMIT_DATA_FILE,
            survey_answer_size_limit: config::FILE_SIZE_LIMIT_SURVEY_ANSWER,
        }
    }
}

impl UploadStage for FormatStage {
    fn name(&self) -> &str {
        "UploadFormatStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let mut record = ctx.record.take().ok_or_else(|| {
            StageError::validation("record not initialized; InitRecordStage must run first")
        })?;

        let result = self.run(ctx, &mut record);
        // The record goes back into the context even on failure, so the
        // final status write can see whatever was built so far.
        ctx.record = Some(record);
        result
    }
}

impl FormatStage {
    fn run(&self, ctx: &mut UploadContext, record: &mut HealthDataRecord) -> Result<(), StageError> {
        let info_json = ctx
            .json_map
            .get(FILENAME_INFO_JSON)
            .cloned()
            .ok_or_else(|| StageError::validation("no parsed info.json in context"))?;
        let manifest = Manifest::new(info_json);

        match manifest.format().unwrap_or(UploadFormat::V1Legacy) {
            UploadFormat::V2Generic => self.handle_generic(ctx, record, &manifest),
            UploadFormat::V1Legacy => {
                let has_survey_ref =
                    manifest.survey_guid().is_some() && manifest.survey_created_on().is_some();
                let has_item = manifest.item().is_some() || manifest.identifier().is_some();
                let data_json_count = ctx
                    .json_map
                    .keys()
                    .filter(|name| {
                        *name != FILENAME_INFO_JSON && *name != FILENAME_METADATA_JSON
                    })
                    .count();

                // Explicit identifiers only resolve by schema id when the
                // data itself is JSON; a binary-only upload's item is a
                // display name and goes through the name-match heuristic.
                if has_survey_ref || (has_item && data_json_count > 0) {
                    self.handle_legacy_explicit(ctx, record, &manifest)
                } else {
                    self.handle_legacy_heuristic(ctx, record, &manifest)
                }
            }
        }
    }

    // -- v2_generic ----------------------------------------------------------

    fn handle_generic(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        manifest: &Manifest,
    ) -> Result<(), StageError> {
        let study_id = ctx.study().id.clone();
        let upload_id = ctx.upload_id().to_string();

        let empty_fields = BTreeMap::new();
        let schema = SchemaResolver::new(&*self.catalog).resolve(
            ResolutionStrategy::Explicit { default_revision: None },
            &ResolveInput {
                study_id: &study_id,
                manifest,
                data_fields: &empty_fields,
            },
        )?;
        record.schema_id = Some(schema.schema_id.clone());
        record.schema_revision = Some(schema.revision);

        parse_created_on_to_record(ctx, manifest, record);

        // Parse the main data file, if one is named and present. Oversized
        // files are skipped with a warning.
        let mut data_file_node = Value::Null;
        if let Some(data_filename) = manifest.data_filename() {
            if let Some(bytes) = ctx.file_map.get(data_filename) {
                let file_size = bytes.len() as u64;
                if file_size > self.data_file_size_limit {
                    tracing::warn!(
                        upload_id = %upload_id,
                        filename = %data_filename,
                        file_size,
                        "Upload data file exceeds max size"
                    );
                } else {
                    data_file_node = serde_json::from_slice(bytes).map_err(|_| {
                        StageError::validation(format!(
                            "Error parsing upload data file, uploadId={upload_id}, \
                             fileName={data_filename}"
                        ))
                    })?;
                }
            }
        }

        let files = std::mem::take(&mut ctx.file_map);
        ctx.file_map = sanitize_keys(files);

        let field_resolver = FieldResolver::new(&*self.blob_store, &self.attachment_bucket);
        let mut cache = ParsedJsonCache::new();

        for field_def in &schema.field_definitions {
            let field_name = &field_def.name;

            let value = if let Some(from_data_file) = data_file_node.get(field_name) {
                // If it's in the submitted data file, just use it.
                if field_def.field_type.is_attachment() {
                    Some(field_resolver.upload_json_as_attachment(
                        from_data_file,
                        &upload_id,
                        field_name,
                    )?)
                } else {
                    Some(from_data_file.clone())
                }
            } else {
                field_resolver.find_value_for_field(
                    &upload_id,
                    &ctx.file_map,
                    field_def,
                    &mut cache,
                )?
            };

            match value {
                Some(value) if !value.is_null() => {
                    record.data_object_mut().insert(field_name.clone(), value);
                }
                _ if field_name == FIELD_ANSWERS && !data_file_node.is_null() => {
                    // The auto-generated survey "answers" field: surveys
                    // submit via the data file, so copy the whole file over.
                    let value = if field_def.field_type.is_attachment() {
                        field_resolver.upload_json_as_attachment(
                            &data_file_node,
                            &upload_id,
                            field_name,
                        )?
                    } else {
                        data_file_node.clone()
                    };
                    record.data_object_mut().insert(field_name.clone(), value);
                }
                _ => {}
            }
        }

        Ok(())
    }

    // -- v1_legacy with explicit metadata ------------------------------------

    fn handle_legacy_explicit(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        manifest: &Manifest,
    ) -> Result<(), StageError> {
        let study_id = ctx.study().id.clone();
        let upload_id = ctx.upload_id().to_string();

        validate_file_list_and_created_on(ctx, manifest, record, &upload_id);

        let files = std::mem::take(&mut ctx.file_map);
        ctx.file_map = sanitize_keys(strip_filename_timestamps(files));

        let empty_fields = BTreeMap::new();
        let schema = SchemaResolver::new(&*self.catalog).resolve(
            ResolutionStrategy::Explicit { default_revision: Some(1) },
            &ResolveInput {
                study_id: &study_id,
                manifest,
                data_fields: &empty_fields,
            },
        )?;
        record.schema_id = Some(schema.schema_id.clone());
        record.schema_revision = Some(schema.revision);

        match schema.schema_type {
            UploadSchemaType::LegacySurvey => {
                // Surveys arrive as one answer file per question; convert to
                // the JSON data shape first, then read fields normally.
                let survey_map = self.convert_survey_to_json_data(ctx, &upload_id);
                self.handle_data(ctx, record, &schema, &survey_map, &upload_id)
            }
            UploadSchemaType::LegacyData => {
                self.handle_data(ctx, record, &schema, &BTreeMap::new(), &upload_id)
            }
            UploadSchemaType::Generic => Err(StageError::validation(format!(
                "Invalid schema type {} for legacy upload",
                schema.schema_type.as_str()
            ))),
        }
    }

    /// Convert survey answer files into a field-name → answer map, plus the
    /// combined top-level "answers" object newer exports expect.
    fn convert_survey_to_json_data(
        &self,
        ctx: &mut UploadContext,
        upload_id: &str,
    ) -> BTreeMap<String, Value> {
        let mut converted = BTreeMap::new();
        let mut messages = Vec::new();

        for (filename, node) in &ctx.json_map {
            if filename == FILENAME_INFO_JSON || filename == FILENAME_METADATA_JSON {
                continue;
            }

            // Survey answer files are tiny; skip anything suspiciously big.
            let normalized = sanitize_field_name(&strip_filename_timestamp(filename));
            if let Some(bytes) = ctx.file_map.get(&normalized) {
                let file_size = bytes.len() as u64;
                if file_size > self.survey_answer_size_limit {
                    tracing::warn!(
                        upload_id = %upload_id,
                        filename = %filename,
                        file_size,
                        "Survey file exceeds max size"
                    );
                    continue;
                }
            }

            if node.is_null() {
                messages.push(format!("Upload ID {upload_id} file {filename} is null"));
                continue;
            }

            // question name ("item")
            let item = match node.get("item").and_then(Value::as_str) {
                None => {
                    messages.push(format!(
                        "Upload ID {upload_id} file {filename} has no question name (item)"
                    ));
                    continue;
                }
                Some(item) if item.trim().is_empty() => {
                    messages.push(format!(
                        "Upload ID {upload_id} file {filename} has blank question name (item)"
                    ));
                    continue;
                }
                Some(item) => item.trim(),
            };

            // question type, with fallback to the older key
            let question_type = node
                .get("questionTypeName")
                .filter(|v| !v.is_null())
                .or_else(|| node.get("questionType").filter(|v| !v.is_null()));
            let question_type = match question_type.and_then(Value::as_str) {
                None => {
                    messages.push(format!(
                        "Upload ID {upload_id} file {filename} has no question type"
                    ));
                    continue;
                }
                Some(qt) if qt.trim().is_empty() => {
                    messages.push(format!(
                        "Upload ID {upload_id} file {filename} has blank question type"
                    ));
                    continue;
                }
                Some(qt) => qt.trim(),
            };

            let Some(answer_key) = survey_answer_key(question_type) else {
                messages.push(format!(
                    "Upload ID {upload_id} file {filename} has unknown question type \
                     {question_type}"
                ));
                continue;
            };

            if let Some(answer) = node.get(answer_key).filter(|v| !v.is_null()) {
                converted.insert(item.to_string(), answer.clone());
            }

            // if there's a unit, add it as well
            if let Some(unit) = node.get("unit").filter(|v| !v.is_null()) {
                converted.insert(format!("{item}{UNIT_FIELD_SUFFIX}"), unit.clone());
            }
        }

        // Newer survey schemas read all answers from one top-level field;
        // populate both shapes for compatibility.
        let answers: Map<String, Value> =
            converted.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        converted.insert(FIELD_ANSWERS.to_string(), Value::Object(answers));

        for message in messages {
            ctx.add_message(message);
        }
        converted
    }

    /// Copy schema fields into the record from the survey answer map or the
    /// unpacked files.
    fn handle_data(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        schema: &UploadSchema,
        survey_map: &BTreeMap<String, Value>,
        upload_id: &str,
    ) -> Result<(), StageError> {
        let field_resolver = FieldResolver::new(&*self.blob_store, &self.attachment_bucket);
        let mut cache = ParsedJsonCache::new();
        let mut messages = Vec::new();

        for field_def in &schema.field_definitions {
            let field_name = &field_def.name;

            let value = if let Some(answer) = survey_map.get(field_name) {
                // Attachments inside a survey are unusual but nothing in the
                // schema system prevents them.
                if field_def.field_type.is_attachment() {
                    Some(field_resolver.upload_json_as_attachment(answer, upload_id, field_name)?)
                } else {
                    Some(answer.clone())
                }
            } else {
                field_resolver.find_value_for_field(
                    upload_id,
                    &ctx.file_map,
                    field_def,
                    &mut cache,
                )?
            };

            copy_json_field(&mut messages, upload_id, value, field_def, record);
        }

        for message in messages {
            ctx.add_message(message);
        }
        Ok(())
    }

    // -- v1_legacy heuristics ------------------------------------------------

    fn handle_legacy_heuristic(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        manifest: &Manifest,
    ) -> Result<(), StageError> {
        let study_id = ctx.study().id.clone();
        let upload_id = ctx.upload_id().to_string();

        validate_file_list_and_created_on(ctx, manifest, record, &upload_id);

        let files = std::mem::take(&mut ctx.file_map);
        ctx.file_map = sanitize_keys(strip_filename_timestamps(files));

        // Classify members: anything that parsed as JSON is data or
        // manifest; the rest is binary.
        let json_normalized: HashSet<String> = ctx
            .json_map
            .keys()
            .map(|name| sanitize_field_name(&strip_filename_timestamp(name)))
            .collect();
        let binary_names: Vec<String> = ctx
            .file_map
            .keys()
            .filter(|name| !json_normalized.contains(*name))
            .cloned()
            .collect();
        let data_json_count = ctx
            .json_map
            .keys()
            .filter(|name| *name != FILENAME_INFO_JSON && *name != FILENAME_METADATA_JSON)
            .count();

        if data_json_count == 0 {
            // The only JSON is the manifest, so expect exactly one binary
            // data file to go with it.
            match binary_names.as_slice() {
                [] => Err(StageError::validation("No data files other than info.json")),
                [filename] => {
                    self.handle_single_binary(ctx, record, manifest, &study_id, &upload_id, filename)
                }
                names => Err(StageError::validation(format!(
                    "Multiple non-JSON files in upload: {}",
                    names.join(", ")
                ))),
            }
        } else {
            self.handle_json_field_set(ctx, record, manifest, &study_id, &upload_id, &binary_names)
        }
    }

    fn handle_single_binary(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        manifest: &Manifest,
        study_id: &str,
        upload_id: &str,
        filename: &str,
    ) -> Result<(), StageError> {
        // Cross-check against the manifest's file list.
        let listed: HashSet<String> = manifest
            .files()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.filename)
            .map(|name| sanitize_field_name(&strip_filename_timestamp(&name)))
            .collect();
        if !listed.contains(filename) {
            ctx.add_message(format!(
                "upload ID {upload_id} contains filename {filename} not found in info.json"
            ));
        }

        let empty_fields = BTreeMap::new();
        let schema = SchemaResolver::new(&*self.catalog).resolve(
            ResolutionStrategy::NonJsonHeuristic,
            &ResolveInput {
                study_id,
                manifest,
                data_fields: &empty_fields,
            },
        )?;
        record.schema_id = Some(schema.schema_id.clone());
        record.schema_revision = Some(schema.revision);

        if schema.field_definitions.len() > 1 {
            // We can only fill one field from an opaque binary; more fields
            // is survivable as long as one of them is an attachment.
            ctx.add_message(format!(
                "upload ID {upload_id} filename {filename} identified schema ID {} rev {} has \
                 multiple fields",
                schema.schema_id, schema.revision
            ));
        }

        let attachment_field = schema
            .field_definitions
            .iter()
            .find(|field| field.field_type.is_attachment())
            .ok_or_else(|| {
                StageError::validation(format!(
                    "Identified schema ID {} rev {} has no field for non-JSON data",
                    schema.schema_id, schema.revision
                ))
            })?;

        if let Some(bytes) = ctx.file_map.get(filename).cloned() {
            ctx.attachments.insert(attachment_field.name.clone(), bytes);
        }
        Ok(())
    }

    fn handle_json_field_set(
        &self,
        ctx: &mut UploadContext,
        record: &mut HealthDataRecord,
        manifest: &Manifest,
        study_id: &str,
        upload_id: &str,
        binary_names: &[String],
    ) -> Result<(), StageError> {
        if !binary_names.is_empty() {
            // A mix of JSON and non-JSON is unexpected; ignore the binaries.
            ctx.add_message(format!(
                "upload ID {upload_id} contains both JSON data and non-JSON data; ignoring \
                 non-JSON data"
            ));
        }

        // Flatten all data JSON files into one field map, keys prefixed by
        // the sanitized source filename to disambiguate.
        let mut flattened: BTreeMap<String, Value> = BTreeMap::new();
        for (filename, node) in &ctx.json_map {
            if filename == FILENAME_INFO_JSON || filename == FILENAME_METADATA_JSON {
                continue;
            }
            let stem = sanitize_field_name(&strip_filename_timestamp(filename));
            if let Some(object) = node.as_object() {
                for (key, value) in object {
                    flattened.insert(format!("{stem}.{}", sanitize_field_name(key)), value.clone());
                }
            }
        }

        let schema = SchemaResolver::new(&*self.catalog).resolve(
            ResolutionStrategy::JsonFieldSetHeuristic,
            &ResolveInput {
                study_id,
                manifest,
                data_fields: &flattened,
            },
        )?;
        record.schema_id = Some(schema.schema_id.clone());
        record.schema_revision = Some(schema.revision);

        for field_def in &schema.field_definitions {
            if let Some(value) = flattened.get(&field_def.name) {
                if field_def.field_type.is_attachment() {
                    ctx.attachments
                        .insert(field_def.name.clone(), value.to_string().into_bytes());
                } else {
                    record
                        .data_object_mut()
                        .insert(field_def.name.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

/// Answer key per survey question type. The mapping is historical; None
/// really does read from scaleAnswer.
fn survey_answer_key(question_type: &str) -> Option<&'static str> {
    match question_type {
        "Boolean" => Some("booleanAnswer"),
        "Date" | "DateAndTime" => Some("dateAnswer"),
        "Decimal" | "Integer" => Some("numericAnswer"),
        "MultipleChoice" | "SingleChoice" => Some("choiceAnswers"),
        "None" | "Scale" => Some("scaleAnswer"),
        "Text" => Some("textAnswer"),
        "TimeInterval" => Some("intervalAnswer"),
        "TimeOfDay" => Some("dateComponentsAnswer"),
        _ => None,
    }
}

/// Read createdOn from the manifest into the record, falling back to the
/// current time with a message. Generic-format flavor: no file list.
fn parse_created_on_to_record(
    ctx: &mut UploadContext,
    manifest: &Manifest,
    record: &mut HealthDataRecord,
) {
    let mut parsed = None;
    if let Some(created_on_str) = manifest.created_on() {
        parsed = parse_flexible_timestamp(created_on_str);
        if parsed.is_none() {
            ctx.add_message(format!("Invalid date-time: {created_on_str}"));
        }
    }

    match parsed {
        Some(ts) => {
            record.created_on = Some(ts.timestamp_millis());
            record.created_on_time_zone = Some(offset_string(&ts));
        }
        None => {
            // Don't set a timezone; it's indeterminate.
            ctx.add_message("Upload has no createdOn; using current time.");
            record.created_on = Some(Utc::now().timestamp_millis());
        }
    }
}

/// Legacy flavor: cross-check the manifest's file list against the archive
/// (recoverable messages only) and compute createdOn with the full fallback
/// chain: manifest createdOn → latest file-list timestamp → now.
fn validate_file_list_and_created_on(
    ctx: &mut UploadContext,
    manifest: &Manifest,
    record: &mut HealthDataRecord,
    upload_id: &str,
) {
    let archive_names: HashSet<String> = ctx.file_map.keys().cloned().collect();
    let mut messages = Vec::new();
    let mut created_on_from_list: Option<DateTime<FixedOffset>> = None;

    match manifest.files() {
        None => {
            messages.push(format!("upload ID {upload_id} info.json does not contain file list"));
        }
        Some(entries) if entries.is_empty() => {
            messages.push(format!("upload ID {upload_id} info.json contains empty file list"));
        }
        Some(entries) => {
            for entry in entries {
                let filename = match entry.filename {
                    None => {
                        messages.push(format!(
                            "upload ID {upload_id} info.json contains file with no name"
                        ));
                        None
                    }
                    Some(filename) => {
                        if !archive_names.contains(&filename) {
                            messages.push(format!(
                                "upload ID {upload_id} info.json contains filename {filename}, \
                                 not found in the archive"
                            ));
                        }
                        Some(filename)
                    }
                };

                // Canonical createdOn from the file list is the latest of
                // the per-file timestamps.
                match entry.timestamp.as_deref().and_then(parse_flexible_timestamp) {
                    Some(ts) => {
                        let later = created_on_from_list
                            .map_or(true, |current| ts > current);
                        if later {
                            created_on_from_list = Some(ts);
                        }
                    }
                    None => {
                        messages.push(format!(
                            "upload ID {upload_id} filename {} has no timestamp",
                            filename.as_deref().unwrap_or("unknown")
                        ));
                    }
                }
            }
        }
    }

    // createdOn in info.json takes top priority, then the file list, then
    // the current time.
    let mut created_on_from_info = None;
    if let Some(created_on_str) = manifest.created_on() {
        created_on_from_info = parse_flexible_timestamp(created_on_str);
        if created_on_from_info.is_none() {
            messages.push(format!("info.json.createdOn is invalid: {created_on_str}"));
        }
    }

    if let Some(ts) = created_on_from_info.or(created_on_from_list) {
        record.created_on = Some(ts.timestamp_millis());
        record.created_on_time_zone = Some(offset_string(&ts));
    } else {
        messages.push(format!("upload ID {upload_id} has no timestamps, using current time"));
        record.created_on = Some(Utc::now().timestamp_millis());
    }

    for message in messages {
        ctx.add_message(message);
    }
}

/// Copy one resolved field value into the record's data map, applying the
/// legacy client repairs.
fn copy_json_field(
    messages: &mut Vec<String>,
    upload_id: &str,
    value: Option<Value>,
    field_def: &UploadFieldDefinition,
    record: &mut HealthDataRecord,
) {
    let Some(value) = value else { return };
    if value.is_null() {
        return;
    }
    let field_name = &field_def.name;

    match field_def.field_type {
        UploadFieldType::CalendarDate => {
            // Older clients submit a timestamp instead of a calendar date;
            // truncate it back.
            let date_str = value.as_str().unwrap_or_default();
            match parse_calendar_date(date_str) {
                Some(date) => {
                    record
                        .data_object_mut()
                        .insert(field_name.clone(), Value::String(date.to_string()));
                }
                None => {
                    let message = format!(
                        "Upload ID {upload_id} field {field_name} has invalid calendar date {value}"
                    );
                    tracing::warn!("{message}");
                    messages.push(message);
                }
            }
        }
        UploadFieldType::String if !value.is_string() => {
            // Some clients "helpfully" convert string-looking ints into
            // actual ints; un-convert them so strict validation passes.
            record
                .data_object_mut()
                .insert(field_name.clone(), Value::String(value.to_string()));
        }
        _ => {
            record.data_object_mut().insert(field_name.clone(), value);
        }
    }
}
