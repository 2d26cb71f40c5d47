use std::str::FromStr;

use serde_json::Value;

use crate::models::UploadFormat;

/// The upload metadata manifest every archive must carry.
pub const FILENAME_INFO_JSON: &str = "info.json";

/// Optional free-form participant metadata file.
pub const FILENAME_METADATA_JSON: &str = "metadata.json";

/// Auto-generated survey answers field.
pub const FIELD_ANSWERS: &str = "answers";

/// Suffix for the companion unit field of a survey answer (`bp_unit`).
pub const UNIT_FIELD_SUFFIX: &str = "_unit";

/// Typed accessors over the parsed `info.json` manifest. The manifest is
/// third-party-authored, so every accessor tolerates absent, null, or
/// wrongly-typed values by returning None.
#[derive(Debug, Clone)]
pub struct Manifest {
    node: Value,
}

/// One entry of the manifest's `files` array.
#[derive(Debug, Clone)]
pub struct ManifestFileEntry {
    pub filename: Option<String>,
    pub timestamp: Option<String>,
}

impl Manifest {
    pub fn new(node: Value) -> Self {
        Self { node }
    }

    /// The manifest verbatim, as stored in the record's metadata.
    pub fn as_value(&self) -> &Value {
        &self.node
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.node
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.node.get(key).and_then(Value::as_i64)
    }

    /// Schema id (or survey question id) this upload claims to be.
    pub fn item(&self) -> Option<&str> {
        self.text("item")
    }

    /// Non-standard alias for `item` sent by some old app builds.
    pub fn identifier(&self) -> Option<&str> {
        self.text("identifier")
    }

    pub fn schema_revision(&self) -> Option<i32> {
        self.int("schemaRevision").map(|v| v as i32)
    }

    pub fn survey_guid(&self) -> Option<&str> {
        self.text("surveyGuid")
    }

    pub fn survey_created_on(&self) -> Option<&str> {
        self.text("surveyCreatedOn")
    }

    pub fn created_on(&self) -> Option<&str> {
        self.text("createdOn")
    }

    pub fn app_version(&self) -> Option<&str> {
        self.text("appVersion")
    }

    pub fn phone_info(&self) -> Option<&str> {
        self.text("phoneInfo")
    }

    /// Name of the main data file, for generic-format uploads.
    pub fn data_filename(&self) -> Option<&str> {
        self.text("dataFilename")
    }

    /// Declared upload format tag. None when absent or unrecognized (the
    /// caller then falls back to the legacy format).
    pub fn format(&self) -> Option<UploadFormat> {
        let tag = self.text("format")?;
        match UploadFormat::from_str(tag) {
            Ok(format) => Some(format),
            Err(_) => {
                tracing::warn!(format = %tag, "Unrecognized format tag in manifest");
                None
            }
        }
    }

    /// The app build number, parsed from the tail of the `appVersion` string
    /// (`"version 1.0.2, build 7"` → 7). Used for per-field app-version
    /// bounds.
    pub fn app_build_number(&self) -> Option<i32> {
        let version = self.app_version()?;
        let digits: String = version
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.chars().rev().collect::<String>().parse().ok()
    }

    /// The manifest's `files` array. None when the key is absent entirely
    /// (distinct from present-but-empty, which callers message differently).
    pub fn files(&self) -> Option<Vec<ManifestFileEntry>> {
        let list = self.node.get("files")?.as_array()?;
        Some(
            list.iter()
                .map(|entry| ManifestFileEntry {
                    filename: entry
                        .get("filename")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    timestamp: entry
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() {
        let manifest = Manifest::new(json!({
            "item": "daily-survey",
            "schemaRevision": 2,
            "createdOn": "2024-05-06T12:00:00Z",
            "appVersion": "version 1.0.2, build 7",
            "phoneInfo": "iPhone 15",
            "format": "v2_generic",
            "dataFilename": "data.json",
        }));

        assert_eq!(manifest.item(), Some("daily-survey"));
        assert_eq!(manifest.schema_revision(), Some(2));
        assert_eq!(manifest.created_on(), Some("2024-05-06T12:00:00Z"));
        assert_eq!(manifest.app_build_number(), Some(7));
        assert_eq!(manifest.format(), Some(UploadFormat::V2Generic));
        assert_eq!(manifest.data_filename(), Some("data.json"));
        assert_eq!(manifest.survey_guid(), None);
    }

    #[test]
    fn blank_and_wrongly_typed_values_are_none() {
        let manifest = Manifest::new(json!({
            "item": "  ",
            "schemaRevision": "2",
            "format": "v9_bogus",
        }));
        assert_eq!(manifest.item(), None);
        assert_eq!(manifest.schema_revision(), None);
        assert_eq!(manifest.format(), None);
    }

    #[test]
    fn files_array() {
        let manifest = Manifest::new(json!({
            "files": [
                {"filename": "data.json", "timestamp": "2024-05-06T12:00:00Z"},
                {"timestamp": "2024-05-06T13:00:00Z"},
                {"filename": "audio.m4a"},
            ]
        }));

        let files = manifest.files().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].filename.as_deref(), Some("data.json"));
        assert!(files[1].filename.is_none());
        assert!(files[2].timestamp.is_none());

        assert!(Manifest::new(json!({})).files().is_none());
    }

    #[test]
    fn build_number_absent_when_unparseable() {
        assert_eq!(Manifest::new(json!({"appVersion": "one"})).app_build_number(), None);
        assert_eq!(Manifest::new(json!({})).app_build_number(), None);
    }
}
