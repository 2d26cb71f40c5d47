use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::config;
use crate::models::UploadFieldDefinition;
use crate::store::BlobStore;

use super::sanitize::sanitize_field_name;
use super::StageError;

/// Cache of parsed-and-sanitized JSON files, keyed by sanitized filename.
/// The caller passes an empty map and reuses it across every field lookup of
/// a single upload so no file is parsed twice.
pub type ParsedJsonCache = HashMap<String, BTreeMap<String, Value>>;

/// Locates a schema field's value in a set of unpacked files.
///
/// Resolution order: an exact whole-file match on the field name first, then
/// a nested-key match against files whose name prefixes the field name
/// (`data_json.hr` → key `hr` of file `data_json`). Attachment-typed values
/// are written to the blob store under `{uploadId}-{fieldName}` and replaced
/// by that reference token. Absence is a non-fatal None.
pub struct FieldResolver<'a> {
    blob_store: &'a dyn BlobStore,
    attachment_bucket: String,
    inline_file_size_limit: u64,
    parsed_json_file_size_limit: u64,
    parsed_json_warning_limit: u64,
}

impl<'a> FieldResolver<'a> {
    pub fn new(blob_store: &'a dyn BlobStore, attachment_bucket: impl Into<String>) -> Self {
        Self {
            blob_store,
            attachment_bucket: attachment_bucket.into(),
            inline_file_size_limit: config::FILE_SIZE_LIMIT_INLINE_FIELD,
            parsed_json_file_size_limit: config::FILE_SIZE_LIMIT_PARSED_JSON,
            parsed_json_warning_limit: config::WARNING_LIMIT_PARSED_JSON,
        }
    }

    /// Override the size ceilings (unit tests).
    pub fn with_limits(mut self, inline: u64, parsed: u64, parsed_warning: u64) -> Self {
        self.inline_file_size_limit = inline;
        self.parsed_json_file_size_limit = parsed;
        self.parsed_json_warning_limit = parsed_warning;
        self
    }

    /// Find the value matching `field_def` in the sanitized file map.
    /// Returns the JSON value, a reference-token string for attachments, or
    /// None when nothing matches.
    pub fn find_value_for_field(
        &self,
        upload_id: &str,
        sanitized_file_map: &BTreeMap<String, Vec<u8>>,
        field_def: &UploadFieldDefinition,
        cache: &mut ParsedJsonCache,
    ) -> Result<Option<Value>, StageError> {
        let field_name = &field_def.name;
        let is_attachment = field_def.field_type.is_attachment();

        // Case 1: the field refers to a whole file.
        if let Some(file_bytes) = sanitized_file_map.get(field_name) {
            if is_attachment {
                if file_bytes.is_empty() {
                    // An empty attachment is treated as absent.
                    return Ok(None);
                }
                let attachment_key = format!("{upload_id}-{field_name}");
                self.blob_store
                    .write_bytes(&self.attachment_bucket, &attachment_key, file_bytes)
                    .map_err(|e| {
                        StageError::validation(format!(
                            "Error writing attachment to blob store, uploadId={upload_id}, \
                             fieldName={field_name}: {e}"
                        ))
                    })?;
                return Ok(Some(Value::String(attachment_key)));
            }

            // Inline fields land in the record row, which has a hard size
            // budget downstream; skip oversized files rather than fail.
            let file_size = file_bytes.len() as u64;
            if file_size > self.inline_file_size_limit {
                tracing::warn!(
                    upload_id = %upload_id,
                    field = %field_name,
                    file_size,
                    "Inline field file exceeds max size"
                );
                return Ok(None);
            }

            let parsed: Value = serde_json::from_slice(file_bytes).map_err(|_| {
                StageError::validation(format!(
                    "Error parsing field file, uploadId={upload_id}, fieldName={field_name}"
                ))
            })?;
            return Ok(Some(parsed));
        }

        // Case 2: the field refers to a top-level key in one of the files;
        // the field name has the file name as a prefix. An ambiguous schema
        // could prefix-match more than one file; first hit wins.
        let mut found_value = None;
        for (filename, file_bytes) in sanitized_file_map {
            let Some(key_name) = nested_key_for(field_name, filename) else {
                continue;
            };

            if !cache.contains_key(filename) {
                let file_size = file_bytes.len() as u64;
                if file_size > self.parsed_json_file_size_limit {
                    tracing::warn!(
                        upload_id = %upload_id,
                        filename = %filename,
                        file_size,
                        "Parsed JSON file exceeds max size"
                    );
                    continue;
                } else if file_size > self.parsed_json_warning_limit {
                    tracing::warn!(
                        upload_id = %upload_id,
                        filename = %filename,
                        file_size,
                        "Parsed JSON file exceeds warning threshold"
                    );
                }

                let parsed: Value = match serde_json::from_slice(file_bytes) {
                    Ok(v) => v,
                    Err(_) => {
                        // Probably the wrong file entirely.
                        tracing::warn!(
                            upload_id = %upload_id,
                            filename = %filename,
                            "Error parsing JSON file"
                        );
                        continue;
                    }
                };

                let sanitized: BTreeMap<String, Value> = parsed
                    .as_object()
                    .map(|obj| {
                        obj.iter()
                            .map(|(k, v)| (sanitize_field_name(k), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                cache.insert(filename.clone(), sanitized);
            }

            if let Some(value) = cache.get(filename).and_then(|map| map.get(key_name)) {
                found_value = Some(value.clone());
                break;
            }
        }

        match found_value {
            None => Ok(None),
            Some(value) if is_attachment => {
                Ok(Some(self.upload_json_as_attachment(&value, upload_id, field_name)?))
            }
            Some(value) => Ok(Some(value)),
        }
    }

    /// Serialize a JSON value, store it as an attachment, and return the
    /// reference token ready for use in a health data record.
    pub fn upload_json_as_attachment(
        &self,
        value: &Value,
        upload_id: &str,
        field_name: &str,
    ) -> Result<Value, StageError> {
        let attachment_key = format!("{upload_id}-{field_name}");
        let bytes = value.to_string().into_bytes();
        self.blob_store
            .write_bytes(&self.attachment_bucket, &attachment_key, &bytes)
            .map_err(|e| {
                StageError::validation(format!(
                    "Error writing attachment to blob store, uploadId={upload_id}, \
                     fieldName={field_name}: {e}"
                ))
            })?;
        Ok(Value::String(attachment_key))
    }
}

/// If `field_name` is `{filename}.{key}`, return the key. None otherwise.
fn nested_key_for<'f>(field_name: &'f str, filename: &str) -> Option<&'f str> {
    let rest = field_name.strip_prefix(filename)?;
    rest.strip_prefix('.').filter(|key| !key.is_empty())
}
