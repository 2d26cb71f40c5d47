use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::ParticipantOptions;

use super::StoreError;

/// Lookup of consent-derived participant options by health code.
pub trait ConsentService: Send + Sync {
    /// None means the participant has no consent record; callers fall back
    /// to no-sharing.
    fn sharing_info(&self, health_code: &str) -> Result<Option<ParticipantOptions>, StoreError>;
}

/// Fixed-map consent service for tests and bootstrap deployments.
#[derive(Default)]
pub struct StaticConsentService {
    options: Mutex<HashMap<String, ParticipantOptions>>,
}

impl StaticConsentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, health_code: impl Into<String>, options: ParticipantOptions) {
        self.options.lock().unwrap().insert(health_code.into(), options);
    }
}

impl ConsentService for StaticConsentService {
    fn sharing_info(&self, health_code: &str) -> Result<Option<ParticipantOptions>, StoreError> {
        Ok(self.options.lock().unwrap().get(health_code).cloned())
    }
}
