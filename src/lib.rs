//! Gantry — upload validation core for a mobile health study platform.
//!
//! Participant phones submit encrypted, gzipped-tar archives of study data.
//! Gantry runs each archive through a stage pipeline (decrypt → unpack →
//! parse → schema-match → canonicalize → persist) and produces one
//! health-data record plus externally stored attachments. Third-party apps
//! emit arbitrarily malformed data, so the pipeline recovers with diagnostic
//! messages wherever it can and fails an upload cleanly when it cannot.

pub mod archive;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod service;
pub mod store;
