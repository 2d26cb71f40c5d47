use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;

use super::UploadStage;

/// Compares the production context against the one a candidate stage
/// produced. Implementations decide what "equivalent" means for the stage
/// under test.
pub trait ContextComparator: Send + Sync {
    fn validate(
        &self,
        production: &UploadContext,
        candidate: &UploadContext,
    ) -> Result<(), StageError>;
}

/// A/B shadow-test harness: runs the production stage normally, then runs a
/// candidate stage against a copy of the context and diffs the results.
///
/// The core guarantee is non-interference. The production stage's outcome —
/// success or error — propagates exactly as if it ran alone. The candidate
/// and the comparator run against a copy, and any failure or panic from
/// either is logged with full upload identifiers and swallowed.
pub struct ShadowStage {
    production: Box<dyn UploadStage>,
    candidate: Box<dyn UploadStage>,
    comparator: Box<dyn ContextComparator>,
}

impl ShadowStage {
    pub fn new(
        production: Box<dyn UploadStage>,
        candidate: Box<dyn UploadStage>,
        comparator: Box<dyn ContextComparator>,
    ) -> Self {
        Self {
            production,
            candidate,
            comparator,
        }
    }
}

impl UploadStage for ShadowStage {
    fn name(&self) -> &str {
        // Transparent wrapper: failures read as the production stage's.
        self.production.name()
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        // Production runs first; its error aborts before the candidate runs.
        self.production.handle(ctx)?;

        let study_id = ctx.study().id.clone();
        let upload_id = ctx.upload_id().to_string();
        let filename = ctx.upload().filename.clone();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut candidate_ctx = ctx.shadow_copy();
            self.candidate.handle(&mut candidate_ctx)?;
            self.comparator.validate(ctx, &candidate_ctx)
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    study_id = %study_id,
                    upload_id = %upload_id,
                    filename = %filename,
                    candidate = self.candidate.name(),
                    error = %e,
                    "Shadow test failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    study_id = %study_id,
                    upload_id = %upload_id,
                    filename = %filename,
                    candidate = self.candidate.name(),
                    "Shadow test panicked"
                );
            }
        }

        Ok(())
    }
}

/// Default comparator: the candidate must resolve the same schema identity
/// and produce the same record data field set as production.
pub struct RecordComparator;

impl ContextComparator for RecordComparator {
    fn validate(
        &self,
        production: &UploadContext,
        candidate: &UploadContext,
    ) -> Result<(), StageError> {
        let (Some(prod_record), Some(cand_record)) = (&production.record, &candidate.record) else {
            return Err(StageError::validation(
                "comparator needs a record in both contexts",
            ));
        };

        if prod_record.schema_id != cand_record.schema_id
            || prod_record.schema_revision != cand_record.schema_revision
        {
            return Err(StageError::validation(format!(
                "schema mismatch: production {:?} rev {:?}, candidate {:?} rev {:?}",
                prod_record.schema_id,
                prod_record.schema_revision,
                cand_record.schema_id,
                cand_record.schema_revision
            )));
        }

        let prod_keys: Vec<&String> =
            prod_record.data_object().map(|m| m.keys().collect()).unwrap_or_default();
        let cand_keys: Vec<&String> =
            cand_record.data_object().map(|m| m.keys().collect()).unwrap_or_default();
        if prod_keys != cand_keys {
            return Err(StageError::validation(format!(
                "record data field mismatch: production {prod_keys:?}, candidate {cand_keys:?}"
            )));
        }

        Ok(())
    }
}
