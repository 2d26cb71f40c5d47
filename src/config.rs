use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Gantry";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Inline field values are stored in the record row itself, which has a hard
/// row-size budget downstream. Whole-file inline fields above this are
/// skipped with a warning.
pub const FILE_SIZE_LIMIT_INLINE_FIELD: u64 = 10 * 1024;

/// Main data file (`dataFilename` in the manifest) above this size is not
/// parsed into memory; the upload proceeds without it.
pub const FILE_SIZE_LIMIT_DATA_FILE: u64 = 2 * 1024 * 1024;

/// Hard ceiling for parsing an upload member as JSON during field lookup.
pub const FILE_SIZE_LIMIT_PARSED_JSON: u64 = 20 * 1024 * 1024;

/// Above this we still parse, but log a warning so oversized producers can
/// be tracked down.
pub const WARNING_LIMIT_PARSED_JSON: u64 = 5 * 1024 * 1024;

/// Survey answer files are tiny key-value JSON; anything bigger is skipped.
pub const FILE_SIZE_LIMIT_SURVEY_ANSWER: u64 = 100 * 1024;

/// Get the application data directory
/// ~/Gantry/ on all platforms (user-visible, operator-inspectable)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Gantry")
}

/// Directory backing the filesystem blob store.
pub fn blob_root_dir() -> PathBuf {
    app_data_dir().join("blobs")
}

/// Path of the durable sqlite store (records, statuses, dedup index).
pub fn store_db_path() -> PathBuf {
    app_data_dir().join("gantry.db")
}

/// Bucket that upload attachments are written to.
pub fn attachment_bucket() -> String {
    std::env::var("GANTRY_ATTACHMENT_BUCKET").unwrap_or_else(|_| "gantry-attachments".into())
}

/// Default log filter for embedding binaries.
pub fn default_log_filter() -> String {
    std::env::var("GANTRY_LOG").unwrap_or_else(|_| "info,gantry=debug".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("Gantry"));
    }

    #[test]
    fn blob_root_under_app_data() {
        let blobs = blob_root_dir();
        assert!(blobs.starts_with(app_data_dir()));
    }

    #[test]
    fn attachment_bucket_has_default() {
        assert!(!attachment_bucket().is_empty());
    }
}
