use serde::{Deserialize, Serialize};

use super::enums::{SharingScope, ValidationStrictness};

/// A research study. Uploads always live in exactly one study; the study
/// settles how strictly its uploads are validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: String,
    pub name: String,
    pub strictness: ValidationStrictness,
}

impl Study {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            // Legacy studies predate required fields, so lenient is the default.
            strictness: ValidationStrictness::Warning,
        }
    }

    pub fn with_strictness(mut self, strictness: ValidationStrictness) -> Self {
        self.strictness = strictness;
        self
    }
}

/// Consent-derived per-participant options, transcribed onto every record so
/// exports don't need a second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOptions {
    pub sharing_scope: SharingScope,
    pub external_id: Option<String>,
    pub data_groups: Vec<String>,
}
