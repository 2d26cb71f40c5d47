use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::models::{HealthDataRecord, UploadStatus};

use super::{DedupIndex, RecordStore, StoreError, ValidationStatus};

/// SQLite-backed durable store: health data records, upload validation
/// statuses, and the dedup index share one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn configure_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

/// Run all pending migrations
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS upload_dedup (
             created_on  INTEGER NOT NULL,
             health_code TEXT NOT NULL,
             schema_key  TEXT NOT NULL,
             upload_id   TEXT NOT NULL,
             PRIMARY KEY (created_on, health_code, schema_key)
         );
         CREATE TABLE IF NOT EXISTS health_data_records (
             id              TEXT PRIMARY KEY,
             upload_id       TEXT NOT NULL,
             study_id        TEXT NOT NULL,
             health_code     TEXT NOT NULL,
             schema_id       TEXT,
             schema_revision INTEGER,
             created_on      INTEGER,
             payload         TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_records_health_code
             ON health_data_records (health_code, created_on);
         CREATE TABLE IF NOT EXISTS upload_statuses (
             upload_id TEXT PRIMARY KEY,
             status    TEXT NOT NULL,
             messages  TEXT NOT NULL,
             record_id TEXT
         );
         INSERT INTO schema_version (version) VALUES (1);",
    )];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running store migration v{version}");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    reason: e.to_string(),
                })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

impl DedupIndex for SqliteStore {
    fn exists(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<String> = conn
            .query_row(
                "SELECT upload_id FROM upload_dedup
                 WHERE created_on = ?1 AND health_code = ?2 AND schema_key = ?3",
                params![created_on, health_code, schema_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn register(
        &self,
        created_on: i64,
        health_code: &str,
        schema_key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        // First registration wins; a concurrent duplicate is a no-op.
        conn.execute(
            "INSERT OR IGNORE INTO upload_dedup (created_on, health_code, schema_key, upload_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![created_on, health_code, schema_key, upload_id],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn create_or_update_record(&self, record: &HealthDataRecord) -> Result<String, StoreError> {
        let record_id = record
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut stored = record.clone();
        stored.id = Some(record_id.clone());
        let payload = serde_json::to_string(&stored)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO health_data_records
                 (id, upload_id, study_id, health_code, schema_id, schema_revision, created_on, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record_id,
                stored.upload_id,
                stored.study_id,
                stored.health_code,
                stored.schema_id,
                stored.schema_revision,
                stored.created_on,
                payload,
            ],
        )?;
        Ok(record_id)
    }

    fn get_record(&self, record_id: &str) -> Result<Option<HealthDataRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM health_data_records WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn write_validation_status(
        &self,
        upload_id: &str,
        status: UploadStatus,
        messages: &[String],
        record_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let messages_json = serde_json::to_string(messages)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO upload_statuses (upload_id, status, messages, record_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![upload_id, status.as_str(), messages_json, record_id],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    /// Read back a validation status, for admin tooling and tests.
    pub fn get_validation_status(
        &self,
        upload_id: &str,
    ) -> Result<Option<ValidationStatus>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, Option<String>)> = conn
            .query_row(
                "SELECT status, messages, record_id FROM upload_statuses WHERE upload_id = ?1",
                params![upload_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((status, messages_json, record_id)) => {
                // A status we can't parse means the table was written by a
                // newer build; surface it as a hard error.
                let status = UploadStatus::from_str(&status)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                Ok(Some(ValidationStatus {
                    upload_id: upload_id.to_string(),
                    status,
                    messages: serde_json::from_str(&messages_json)?,
                    record_id,
                }))
            }
            None => Ok(None),
        }
    }
}
