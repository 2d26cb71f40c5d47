use std::sync::Arc;

use crate::archive::Decryptor;
use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;

use super::UploadStage;

/// Decrypts the raw archive bytes with the study's key.
pub struct DecryptStage {
    decryptor: Arc<dyn Decryptor>,
}

impl DecryptStage {
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self { decryptor }
    }
}

impl UploadStage for DecryptStage {
    fn name(&self) -> &str {
        "DecryptStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let raw = ctx
            .raw_archive
            .clone()
            .ok_or_else(|| StageError::validation("upload has no raw archive bytes"))?;

        let decrypted = self.decryptor.decrypt(&ctx.study().id, &raw)?;
        ctx.decrypted_archive = Some(Arc::new(decrypted));
        Ok(())
    }
}
