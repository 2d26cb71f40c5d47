//! Durable collaborators of the pipeline: blob storage, the schema/survey
//! catalog, the dedup index, record persistence, and consent lookup. Every
//! collaborator is a trait; production code wires the sqlite/filesystem
//! implementations, tests wire the in-memory ones.

pub mod blob;
pub mod catalog;
pub mod consent;
pub mod dedup;
pub mod records;
pub mod sqlite;

pub use blob::*;
pub use catalog::*;
pub use consent::*;
pub use dedup::*;
pub use records::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema not found: {schema_id} revision {revision} in study {study_id}")]
    SchemaNotFound {
        study_id: String,
        schema_id: String,
        revision: i32,
    },

    #[error("Survey not found: {guid}:{created_on}")]
    SurveyNotFound { guid: String, created_on: i64 },

    #[error("Blob not found: {bucket}/{key}")]
    BlobNotFound { bucket: String, key: String },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}
