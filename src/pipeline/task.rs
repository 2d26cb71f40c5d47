use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::models::UploadStatus;
use crate::store::{RecordStore, StoreError};

use super::context::UploadContext;
use super::stages::UploadStage;
use super::StageError;

/// Runs the ordered stage list against one context, to completion or first
/// failure, then writes the final validation status exactly once.
///
/// One task owns one context; concurrency across uploads is independent
/// tasks, never shared contexts. Uploads commonly contain garbage, so an
/// ordinary validation failure logs at info — only catastrophic faults
/// (panics, resource exhaustion) are alarm-worthy.
pub struct ValidationTask {
    stages: Vec<Box<dyn UploadStage>>,
    record_store: Arc<dyn RecordStore>,
}

impl ValidationTask {
    pub fn new(stages: Vec<Box<dyn UploadStage>>, record_store: Arc<dyn RecordStore>) -> Self {
        Self {
            stages,
            record_store,
        }
    }

    /// Execute the pipeline. Never panics and never returns an error; every
    /// outcome ends in a status write (whose own failure is only logged).
    pub fn run(&self, ctx: &mut UploadContext) {
        for stage in &self.stages {
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| stage.handle(ctx)));
            // Timing is diagnostic only; it must never affect control flow.
            tracing::debug!(
                stage = stage.name(),
                upload_id = %ctx.upload_id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage finished"
            );

            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(payload) => StageError::Catastrophic(format!(
                    "stage panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            ctx.set_success(false);
            let message = format!(
                "Exception thrown from upload validation stage {}: {}: {}",
                stage.name(),
                error.kind(),
                error
            );
            if error.is_catastrophic() {
                tracing::error!(upload_id = %ctx.upload_id(), "{message}");
            } else {
                tracing::info!(upload_id = %ctx.upload_id(), "{message}");
            }
            ctx.add_message(message);
            // Fail fast; remaining stages are skipped.
            break;
        }

        let status = if ctx.success() {
            UploadStatus::Succeeded
        } else {
            UploadStatus::ValidationFailed
        };

        let write_result = self.record_store.write_validation_status(
            ctx.upload_id(),
            status,
            ctx.messages(),
            ctx.record_id.as_deref(),
        );
        if let Err(error) = write_result {
            self.log_write_validation_status_error(ctx, status, &error);
        }
    }

    fn log_write_validation_status_error(
        &self,
        ctx: &UploadContext,
        status: UploadStatus,
        error: &StoreError,
    ) {
        tracing::error!(
            upload_id = %ctx.upload_id(),
            status = status.as_str(),
            error = %error,
            "Failed to write validation status"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
