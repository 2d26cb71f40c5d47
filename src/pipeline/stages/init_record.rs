use chrono::Utc;

use crate::models::HealthDataRecord;
use crate::pipeline::context::UploadContext;
use crate::pipeline::manifest::{Manifest, FILENAME_INFO_JSON, FILENAME_METADATA_JSON};
use crate::pipeline::StageError;

use super::UploadStage;

/// Seeds the health data record from the upload identity and the manifest.
///
/// An archive without a parseable `info.json` cannot be interpreted at all,
/// so that is the one fatal case here.
pub struct InitRecordStage;

impl UploadStage for InitRecordStage {
    fn name(&self) -> &str {
        "InitRecordStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let upload_id = ctx.upload_id().to_string();

        let info_json = ctx.json_map.get(FILENAME_INFO_JSON).cloned().ok_or_else(|| {
            StageError::validation(format!(
                "upload ID {upload_id} does not contain info.json file"
            ))
        })?;
        let manifest = Manifest::new(info_json);

        let mut record = HealthDataRecord::new(
            ctx.health_code(),
            &ctx.study().id,
            &upload_id,
            ctx.upload().upload_date,
            Utc::now().timestamp_millis(),
        );

        // The manifest verbatim is the record's metadata.
        record.metadata = manifest.as_value().clone();
        record.app_version = manifest.app_version().map(str::to_string);
        record.phone_info = manifest.phone_info().map(str::to_string);

        // metadata.json is free-form participant metadata; carry it when
        // present and well-formed.
        if let Some(user_metadata) = ctx.json_map.get(FILENAME_METADATA_JSON) {
            record.user_metadata = Some(user_metadata.clone());
        } else if ctx.file_map.contains_key(FILENAME_METADATA_JSON) {
            ctx.add_message(format!(
                "upload ID {upload_id} metadata.json is malformed, ignoring"
            ));
        }

        ctx.record = Some(record);
        Ok(())
    }
}
