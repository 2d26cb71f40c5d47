use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Descriptor of one submitted archive. The binary itself lives in the
/// upload bucket; this is the metadata the pipeline runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    /// Opaque code identifying the contributing participant. Never a name or
    /// account id.
    pub health_code: String,
    pub filename: String,
    /// Calendar date the archive was received, in the platform's local zone.
    pub upload_date: NaiveDate,
}

impl Upload {
    pub fn new(
        id: impl Into<String>,
        health_code: impl Into<String>,
        filename: impl Into<String>,
        upload_date: NaiveDate,
    ) -> Self {
        Self {
            id: id.into(),
            health_code: health_code.into(),
            filename: filename.into(),
            upload_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_serializes() {
        let upload = Upload::new(
            "upload-1",
            "hc-123",
            "archive.tgz",
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        );
        let json = serde_json::to_string(&upload).unwrap();
        assert!(json.contains("upload-1"));
        assert!(json.contains("2024-05-06"));
    }
}
