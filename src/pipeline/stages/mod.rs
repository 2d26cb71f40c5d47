//! The pipeline stages, in production order: decrypt → unpack → parse JSON →
//! init record → format handler → transcribe consent → strict validation →
//! artifacts → dedup. The shadow stage can wrap any of them.

pub mod artifacts;
pub mod decrypt;
pub mod dedup;
pub mod format;
pub mod init_record;
pub mod parse_json;
pub mod shadow;
pub mod strict;
pub mod transcribe;
pub mod unpack;

pub use artifacts::*;
pub use decrypt::*;
pub use dedup::*;
pub use format::*;
pub use init_record::*;
pub use parse_json::*;
pub use shadow::*;
pub use strict::*;
pub use transcribe::*;
pub use unpack::*;

use super::context::UploadContext;
use super::StageError;

/// One stage of the upload validation pipeline.
///
/// Stages read and write slots of the shared context. A stage must re-read
/// its inputs from the context on every call and never cache slot references
/// across invocations; with shadow copies in play, a cached reference can go
/// stale. A missing input slot is a clean validation failure, not a panic.
pub trait UploadStage: Send + Sync {
    /// Stage name used in failure messages and timing logs.
    fn name(&self) -> &str;

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError>;
}
