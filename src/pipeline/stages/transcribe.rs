use std::sync::Arc;

use crate::models::SharingScope;
use crate::pipeline::context::UploadContext;
use crate::pipeline::StageError;
use crate::store::ConsentService;

use super::UploadStage;

/// Transcribes consent-derived participant options (sharing scope, external
/// id, data groups) onto the record, so exports don't need a second lookup.
/// A participant without a consent record contributes no-sharing data.
pub struct TranscribeConsentStage {
    consent: Arc<dyn ConsentService>,
}

impl TranscribeConsentStage {
    pub fn new(consent: Arc<dyn ConsentService>) -> Self {
        Self { consent }
    }
}

impl UploadStage for TranscribeConsentStage {
    fn name(&self) -> &str {
        "TranscribeConsentStage"
    }

    fn handle(&self, ctx: &mut UploadContext) -> Result<(), StageError> {
        let health_code = ctx.health_code().to_string();
        let upload_id = ctx.upload_id().to_string();

        let record = ctx
            .record
            .as_mut()
            .ok_or_else(|| StageError::validation("record not initialized"))?;

        match self.consent.sharing_info(&health_code)? {
            Some(options) => {
                record.user_sharing_scope = Some(options.sharing_scope);
                record.user_external_id = options.external_id;
                record.user_data_groups = options.data_groups;
            }
            None => {
                record.user_sharing_scope = Some(SharingScope::NoSharing);
                ctx.add_message(format!(
                    "upload {upload_id} has no consent record; defaulting to no_sharing"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthDataRecord, ParticipantOptions, Study, Upload};
    use crate::store::StaticConsentService;
    use chrono::NaiveDate;

    fn context() -> UploadContext {
        let mut ctx = UploadContext::new(
            Study::new("cardio-flex", "CardioFlex"),
            Upload::new(
                "upload-1",
                "hc-123",
                "archive.tgz",
                NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            ),
        );
        ctx.record = Some(HealthDataRecord::new(
            "hc-123",
            "cardio-flex",
            "upload-1",
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            1_714_953_600_000,
        ));
        ctx
    }

    #[test]
    fn transcribes_participant_options() {
        let consent = StaticConsentService::new();
        consent.put(
            "hc-123",
            ParticipantOptions {
                sharing_scope: SharingScope::AllQualifiedResearchers,
                external_id: Some("ext-9".into()),
                data_groups: vec!["pilot".into(), "wave2".into()],
            },
        );
        let stage = TranscribeConsentStage::new(Arc::new(consent));

        let mut ctx = context();
        stage.handle(&mut ctx).unwrap();

        let record = ctx.record.as_ref().unwrap();
        assert_eq!(
            record.user_sharing_scope,
            Some(SharingScope::AllQualifiedResearchers)
        );
        assert_eq!(record.user_external_id.as_deref(), Some("ext-9"));
        assert_eq!(record.user_data_groups, vec!["pilot", "wave2"]);
        assert!(ctx.messages().is_empty());
    }

    #[test]
    fn no_consent_record_defaults_to_no_sharing() {
        let stage = TranscribeConsentStage::new(Arc::new(StaticConsentService::new()));

        let mut ctx = context();
        stage.handle(&mut ctx).unwrap();

        assert_eq!(
            ctx.record.as_ref().unwrap().user_sharing_scope,
            Some(SharingScope::NoSharing)
        );
        assert!(ctx.messages()[0].contains("no consent record"));
    }

    #[test]
    fn missing_record_fails_cleanly() {
        let stage = TranscribeConsentStage::new(Arc::new(StaticConsentService::new()));
        let mut ctx = context();
        ctx.record = None;

        assert!(stage.handle(&mut ctx).is_err());
    }
}
