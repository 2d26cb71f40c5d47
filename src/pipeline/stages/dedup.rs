use std::sync::Arc;

use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;
use crate::store::DedupIndex;

use super::UploadStage;

/// Advisory duplicate detection: checks the (createdOn, healthCode,
/// schemaKey) triple against the dedup index and registers it when new.
///
/// This stage never fails the pipeline. A duplicate is a diagnostic message;
/// an index outage is logged and swallowed — downstream persistence must not
/// depend on dedup succeeding.
pub struct DedupStage {
    index: Arc<dyn DedupIndex>,
}

impl DedupStage {
    pub fn new(index: Arc<dyn DedupIndex>) -> Self {
        Self { index }
    }
}

impl UploadStage for DedupStage {
    fn name(&self) -> &str {
        "DedupStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let upload_id = ctx.upload_id().to_string();

        // No record or no resolved schema: nothing to key on.
        let Some((created_on, health_code, schema_key)) = ctx.record.as_ref().and_then(|record| {
            match (record.created_on, record.schema_key()) {
                (Some(created_on), Some(schema_key)) => {
                    Some((created_on, record.health_code.clone(), schema_key))
                }
                _ => None,
            }
        }) else {
            return Ok(());
        };

        match self.index.exists(created_on, &health_code, &schema_key) {
            Ok(true) => {
                tracing::info!(
                    upload_id = %upload_id,
                    schema_key = %schema_key,
                    created_on,
                    "Duplicate upload detected"
                );
                ctx.add_message(format!(
                    "Upload {upload_id} is a duplicate submission (createdOn={created_on}, \
                     schemaKey={schema_key})"
                ));
            }
            Ok(false) => {
                if let Err(e) = self
                    .index
                    .register(created_on, &health_code, &schema_key, &upload_id)
                {
                    tracing::warn!(
                        upload_id = %upload_id,
                        error = %e,
                        "Failed to register dedup key — continuing"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %e,
                    "Dedup existence check failed — continuing"
                );
            }
        }

        Ok(())
    }
}
