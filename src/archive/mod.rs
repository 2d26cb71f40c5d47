//! Archive preparation: symmetric decryption of the raw upload blob and
//! decompression into a filename → bytes map. Both are collaborator traits
//! so the pipeline stages stay testable with in-memory fakes.

pub mod decrypt;
pub mod unpack;

pub use decrypt::*;
pub use unpack::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No archive key registered for study {0}")]
    MissingStudyKey(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Malformed archive: {0}")]
    Malformed(String),

    #[error("Archive has too many entries ({count} > {limit})")]
    TooManyEntries { count: usize, limit: usize },

    #[error("Archive unpacked size exceeds {limit} bytes")]
    TotalSizeExceeded { limit: u64 },
}
