use serde_json::Value;

use crate::config;
use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;

use super::UploadStage;

/// Parses every `*.json` member of the archive into the context's JSON map.
///
/// Unparseable JSON files get a diagnostic message but are left in the file
/// map; whether their absence from the JSON map matters is for later stages
/// to decide (a missing info.json is fatal, a corrupt data file may not be).
pub struct ParseJsonStage {
    parse_size_limit: u64,
}

impl ParseJsonStage {
    pub fn new() -> Self {
        Self {
            parse_size_limit: config::FILE_SIZE_LIMIT_PARSED_JSON,
        }
    }
}

impl Default for ParseJsonStage {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStage for ParseJsonStage {
    fn name(&self) -> &str {
        "ParseJsonStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let upload_id = ctx.upload_id().to_string();
        let mut parsed = Vec::new();
        let mut messages = Vec::new();

        for (filename, bytes) in &ctx.file_map {
            if !filename.to_ascii_lowercase().ends_with(".json") {
                continue;
            }

            let file_size = bytes.len() as u64;
            if file_size > self.parse_size_limit {
                tracing::warn!(
                    upload_id = %upload_id,
                    filename = %filename,
                    file_size,
                    "JSON file exceeds parse size limit, skipping"
                );
                continue;
            }

            match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => parsed.push((filename.clone(), value)),
                Err(_) => messages.push(format!(
                    "upload ID {upload_id} file {filename} could not be parsed as JSON"
                )),
            }
        }

        for (filename, value) in parsed {
            ctx.json_map.insert(filename, value);
        }
        for message in messages {
            ctx.add_message(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Study, Upload};
    use chrono::NaiveDate;
    use serde_json::json;

    fn context() -> UploadContext {
        UploadContext::new(
            Study::new("cardio-flex", "CardioFlex"),
            Upload::new(
                "upload-1",
                "hc-123",
                "archive.tgz",
                NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            ),
        )
    }

    #[test]
    fn parses_json_members_only() {
        let mut ctx = context();
        ctx.file_map.insert("info.json".into(), br#"{"item":"x"}"#.to_vec());
        ctx.file_map.insert("audio.m4a".into(), vec![0, 1, 2]);

        ParseJsonStage::new().handle(&mut ctx).unwrap();
        assert_eq!(ctx.json_map.len(), 1);
        assert_eq!(ctx.json_map["info.json"], json!({"item": "x"}));
        // Binary members remain available in the file map.
        assert!(ctx.file_map.contains_key("audio.m4a"));
    }

    #[test]
    fn unparseable_json_gets_a_message() {
        let mut ctx = context();
        ctx.file_map.insert("data.json".into(), b"{broken".to_vec());

        ParseJsonStage::new().handle(&mut ctx).unwrap();
        assert!(ctx.json_map.is_empty());
        assert_eq!(ctx.messages().len(), 1);
        assert!(ctx.messages()[0].contains("data.json"));
    }

    #[test]
    fn case_insensitive_extension() {
        let mut ctx = context();
        ctx.file_map.insert("DATA.JSON".into(), b"[1,2]".to_vec());

        ParseJsonStage::new().handle(&mut ctx).unwrap();
        assert_eq!(ctx.json_map["DATA.JSON"], json!([1, 2]));
    }
}
