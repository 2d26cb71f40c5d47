//! The upload validation pipeline: a sequential chain of stateful stages
//! operating over one shared mutable context per upload, culminating in a
//! persisted health-data record plus externally stored attachments.

pub mod canon;
pub mod context;
pub mod field_resolver;
pub mod manifest;
pub mod sanitize;
pub mod schema_resolver;
pub mod stages;
pub mod task;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::store::StoreError;

/// Failure of one pipeline stage.
///
/// `Validation` is the ordinary case: the upload contained something the
/// pipeline can't process, the run is marked failed, and nobody gets paged.
/// `Catastrophic` marks resource-class faults (a stage panicked, allocation
/// blew up) that the orchestrator logs at error severity. Advisory stages
/// (dedup, shadow testing) never return an error at all — their failures
/// are swallowed internally, so the orchestrator's fail-fast logic cannot
/// mistake them for pipeline-aborting ones.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Catastrophic(String),
}

impl StageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Short kind label used in the failure message written to the context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation error",
            Self::Catastrophic(_) => "catastrophic error",
        }
    }

    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Self::Catastrophic(_))
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ArchiveError> for StageError {
    fn from(err: ArchiveError) -> Self {
        Self::Validation(err.to_string())
    }
}
