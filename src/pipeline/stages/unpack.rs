use std::sync::Arc;

use crate::archive::Unpacker;
use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;

use super::UploadStage;

/// Decompresses the decrypted archive into the filename → bytes map.
pub struct UnpackStage {
    unpacker: Arc<dyn Unpacker>,
}

impl UnpackStage {
    pub fn new(unpacker: Arc<dyn Unpacker>) -> Self {
        Self { unpacker }
    }
}

impl UploadStage for UnpackStage {
    fn name(&self) -> &str {
        "UnpackStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let decrypted = ctx
            .decrypted_archive
            .clone()
            .ok_or_else(|| StageError::validation("upload has no decrypted archive bytes"))?;

        let files = self.unpacker.unpack(&decrypted)?;
        if files.is_empty() {
            return Err(StageError::validation("archive contains no files"));
        }

        tracing::debug!(
            upload_id = %ctx.upload_id(),
            file_count = files.len(),
            "Archive unpacked"
        );
        ctx.file_map = files;
        Ok(())
    }
}
