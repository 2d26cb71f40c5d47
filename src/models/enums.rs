use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error for parsing a stored string back into one of the domain enums.
#[derive(Debug, Error)]
#[error("Invalid {field} value: {value}")]
pub struct InvalidEnumValue {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnumValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnumValue {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(UploadStatus {
    Requested => "requested",
    ValidationInProgress => "validation_in_progress",
    Succeeded => "succeeded",
    ValidationFailed => "validation_failed",
});

str_enum!(UploadFormat {
    V1Legacy => "v1_legacy",
    V2Generic => "v2_generic",
});

str_enum!(UploadSchemaType {
    LegacyData => "legacy_data",
    LegacySurvey => "legacy_survey",
    Generic => "generic",
});

str_enum!(UploadFieldType {
    Boolean => "boolean",
    CalendarDate => "calendar_date",
    Timestamp => "timestamp",
    Int => "int",
    Float => "float",
    String => "string",
    SingleChoice => "single_choice",
    MultiChoice => "multi_choice",
    InlineJsonBlob => "inline_json_blob",
    AttachmentBlob => "attachment_blob",
    AttachmentCsv => "attachment_csv",
    AttachmentJsonBlob => "attachment_json_blob",
    AttachmentJsonTable => "attachment_json_table",
    LargeTextAttachment => "large_text_attachment",
});

impl UploadFieldType {
    /// Attachment-typed fields are stored in the blob store and referenced
    /// from the record by token, never inlined.
    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            Self::AttachmentBlob
                | Self::AttachmentCsv
                | Self::AttachmentJsonBlob
                | Self::AttachmentJsonTable
                | Self::LargeTextAttachment
        )
    }
}

str_enum!(ValidationStrictness {
    Warning => "warning",
    Report => "report",
    Strict => "strict",
});

str_enum!(SharingScope {
    NoSharing => "no_sharing",
    SponsorsAndPartners => "sponsors_and_partners",
    AllQualifiedResearchers => "all_qualified_researchers",
});
