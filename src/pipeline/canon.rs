//! The canonicalization engine: pure per-type coercion from an arbitrary
//! JSON value to the canonical representation for a field's declared type.
//!
//! Canonicalization never panics and never throws; it always returns a
//! [`CanonicalizationResult`], so a caller can aggregate all field errors in
//! one pass before deciding overall success.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::models::{UploadFieldDefinition, UploadFieldType};

/// Either a canonical JSON value, or an error message. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalizationResult {
    Valid(Value),
    Invalid(String),
}

impl CanonicalizationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Valid(v) => Some(v),
            Self::Invalid(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Valid(_) => None,
            Self::Invalid(msg) => Some(msg),
        }
    }
}

/// Canonicalize an upload JSON value given the schema field's declared type.
pub fn canonicalize(value: &Value, field_type: UploadFieldType) -> CanonicalizationResult {
    // Short-cut: absent and JSON-null values pass through untouched; the
    // required-field check is the caller's job.
    if value.is_null() {
        return CanonicalizationResult::Valid(Value::Null);
    }

    match field_type {
        UploadFieldType::AttachmentBlob
        | UploadFieldType::AttachmentCsv
        | UploadFieldType::AttachmentJsonBlob
        | UploadFieldType::AttachmentJsonTable
        | UploadFieldType::LargeTextAttachment
        | UploadFieldType::InlineJsonBlob => {
            // always valid, always canonical
            CanonicalizationResult::Valid(value.clone())
        }
        UploadFieldType::Boolean => {
            if value.is_boolean() {
                CanonicalizationResult::Valid(value.clone())
            } else {
                CanonicalizationResult::Invalid(format!("Invalid boolean JSON value {value}"))
            }
        }
        UploadFieldType::CalendarDate => {
            let Some(date_str) = value.as_str() else {
                return CanonicalizationResult::Invalid(format!(
                    "Invalid calendar date JSON value {value}"
                ));
            };
            match parse_calendar_date(date_str) {
                Some(date) => CanonicalizationResult::Valid(Value::String(date.to_string())),
                None => CanonicalizationResult::Invalid(format!(
                    "Invalid calendar date string {date_str}"
                )),
            }
        }
        UploadFieldType::Timestamp => {
            if let Some(millis) = value.as_i64() {
                // Integral numbers are epoch milliseconds, implicitly UTC.
                match timestamp_from_millis(millis) {
                    Some(ts) => CanonicalizationResult::Valid(Value::String(
                        canonical_timestamp_string(&ts.fixed_offset()),
                    )),
                    None => CanonicalizationResult::Invalid(format!(
                        "Invalid epoch milliseconds {millis}"
                    )),
                }
            } else if let Some(ts_str) = value.as_str() {
                match parse_flexible_timestamp(ts_str) {
                    Some(ts) => CanonicalizationResult::Valid(Value::String(
                        canonical_timestamp_string(&ts),
                    )),
                    None => CanonicalizationResult::Invalid(format!(
                        "Invalid date-time (timestamp) string {ts_str}"
                    )),
                }
            } else {
                CanonicalizationResult::Invalid(format!(
                    "Invalid date-time (timestamp) JSON value {value}"
                ))
            }
        }
        UploadFieldType::Int => {
            if value.is_i64() || value.is_u64() {
                // Already canonicalized
                CanonicalizationResult::Valid(value.clone())
            } else if let Some(float_value) = value.as_f64() {
                // Truncate floats toward zero.
                CanonicalizationResult::Valid(Value::from(float_value.trunc() as i64))
            } else {
                CanonicalizationResult::Invalid(format!("Invalid int JSON value {value}"))
            }
        }
        UploadFieldType::Float => {
            if value.is_number() {
                CanonicalizationResult::Valid(value.clone())
            } else {
                CanonicalizationResult::Invalid(format!("Invalid decimal JSON value {value}"))
            }
        }
        UploadFieldType::String => {
            if value.is_string() {
                CanonicalizationResult::Valid(value.clone())
            } else {
                CanonicalizationResult::Invalid(format!("Invalid string JSON value {value}"))
            }
        }
        UploadFieldType::SingleChoice => {
            // Older clients send a single-element array as a single-choice
            // answer. Accept that shape, but use just the element.
            let unwrapped = if let Some(arr) = value.as_array() {
                if arr.len() == 1 {
                    &arr[0]
                } else {
                    return CanonicalizationResult::Invalid(format!(
                        "Single-choice array doesn't have exactly 1 element: {value}"
                    ));
                }
            } else {
                value
            };
            CanonicalizationResult::Valid(convert_to_string_value(unwrapped))
        }
        UploadFieldType::MultiChoice => {
            // Expect the format ["foo", "bar", "baz"].
            let Some(arr) = value.as_array() else {
                return CanonicalizationResult::Invalid(format!(
                    "Invalid multi-choice JSON value {value}"
                ));
            };
            let converted: Vec<Value> = arr.iter().map(convert_to_string_value).collect();
            CanonicalizationResult::Valid(Value::Array(converted))
        }
    }
}

/// Validate a canonicalized multi-choice value against the field's declared
/// answer list, returning one error per invalid answer. The caller decides
/// whether the invalid answers still get written back.
pub fn validate_multi_choice_answers(
    field_def: &UploadFieldDefinition,
    canonical_value: &Value,
) -> Vec<String> {
    if field_def.allow_other_choices {
        return Vec::new();
    }

    let valid_answers: HashSet<&str> = field_def
        .multi_choice_answer_list
        .iter()
        .map(String::as_str)
        .collect();

    let Some(answers) = canonical_value.as_array() else {
        return Vec::new();
    };

    answers
        .iter()
        .filter_map(|answer| {
            let text = answer.as_str().map(str::to_string).unwrap_or_else(|| answer.to_string());
            if valid_answers.contains(text.as_str()) {
                None
            } else {
                Some(format!(
                    "Multi-Choice field {} contains invalid answer {}",
                    field_def.name, text
                ))
            }
        })
        .collect()
}

/// Convert any JSON value into a string value: strings pass through, nulls
/// stay null, everything else becomes its JSON text.
pub fn convert_to_string_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

/// Parse a calendar date string. Some clients insert a time-of-day into
/// calendar dates; strings longer than 10 characters are truncated back to
/// the date part before parsing. Truncating a timestamp to a date is
/// inherently ambiguous across zones, which is accepted.
pub fn parse_calendar_date(date_str: &str) -> Option<NaiveDate> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    let truncated = if trimmed.len() > 10 {
        tracing::warn!(date = %trimmed, "Non-standard calendar date in upload data");
        // Byte 10 may not be a char boundary in garbage input; a date that
        // can't be truncated there can't be a date.
        match trimmed.get(..10) {
            Some(prefix) => prefix,
            None => return None,
        }
    } else {
        trimmed
    };

    match NaiveDate::parse_from_str(truncated, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            tracing::warn!(date = %truncated, "Malformatted calendar date in upload data");
            None
        }
    }
}

/// Parse a timestamp string, tolerating the non-ISO `YYYY-MM-DD hh:mm:ss
/// +ZZZZ` form some apps emit: the space after the date becomes a `T` and
/// remaining whitespace is stripped before parsing.
pub fn parse_flexible_timestamp(timestamp_str: &str) -> Option<DateTime<FixedOffset>> {
    // Timestamps need at least 11 chars to hold a date plus separator.
    if timestamp_str.trim().is_empty() || timestamp_str.len() < 11 {
        return None;
    }

    let repaired;
    let candidate = if timestamp_str.as_bytes()[10] == b' ' {
        tracing::warn!(timestamp = %timestamp_str, "Non-standard timestamp in upload data");
        let mut s = String::with_capacity(timestamp_str.len());
        s.push_str(&timestamp_str[..10]);
        s.push('T');
        s.extend(timestamp_str[11..].chars().filter(|c| !c.is_whitespace()));
        repaired = s;
        repaired.as_str()
    } else {
        timestamp_str
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
        return Some(ts);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(ts) = DateTime::parse_from_str(candidate, format) {
            return Some(ts);
        }
    }

    tracing::warn!(timestamp = %timestamp_str, "Malformatted timestamp in upload data");
    None
}

/// Epoch milliseconds → UTC timestamp. None for out-of-range values.
pub fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// The canonical rendering of a timestamp: RFC 3339 with milliseconds,
/// offset preserved.
pub fn canonical_timestamp_string(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// The offset part of a timestamp (for example `-07:00`), stored alongside
/// createdOn so exports can recover the participant's local time.
pub fn offset_string(ts: &DateTime<FixedOffset>) -> String {
    ts.format("%:z").to_string()
}
