use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Anything outside the sanitized identifier alphabet.
static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

/// Filenames sometimes carry embedded timestamps (`data-20240506120000.json`),
/// which breaks filename-prefix field lookups. Any run of 8 or more digits
/// with its leading dash is treated as a timestamp.
static FILENAME_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d{8,}").unwrap());

/// Whether a name is already a valid schema field name: letters, digits, and
/// underscores, not starting with a digit.
pub fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        None => return false,
        Some(c) if c.is_ascii_digit() => return false,
        Some(c) if !(c.is_ascii_alphanumeric() || c == '_') => return false,
        Some(_) => {}
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Sanitize an arbitrary key into the field-name alphabet. Invalid
/// characters become underscores; a leading digit gets an underscore prefix.
pub fn sanitize_field_name(name: &str) -> String {
    let replaced = INVALID_CHARS.replace_all(name, "_");
    if replaced.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("_{replaced}")
    } else {
        replaced.into_owned()
    }
}

/// Sanitize every key of a map, keeping values. Later keys win on the rare
/// sanitized-name collision.
pub fn sanitize_keys<V>(map: BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.into_iter()
        .map(|(k, v)| (sanitize_field_name(&k), v))
        .collect()
}

/// Strip embedded timestamps from a single filename.
pub fn strip_filename_timestamp(name: &str) -> String {
    FILENAME_TIMESTAMP.replace_all(name, "").into_owned()
}

/// Strip embedded timestamps from every filename key.
pub fn strip_filename_timestamps<V>(map: BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.into_iter()
        .map(|(k, v)| (strip_filename_timestamp(&k), v))
        .collect()
}
