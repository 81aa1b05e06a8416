use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Backend identifier of a blob (table or index).
pub type BlobId = String;
pub type TableId = BlobId;
pub type DocumentId = String;
pub type Timestamp = DateTime<Utc>;

/// One record of a table. Reserved keys are prefixed with `$`.
pub type Document = Map<String, Value>;

pub const SYSTEM_FIELD_PREFIX: char = '$';
pub const ID_FIELD: &str = "$id";
pub const CREATED_AT_FIELD: &str = "$createdAt";
pub const UPDATED_AT_FIELD: &str = "$updatedAt";

pub fn is_system_field(key: &str) -> bool {
    key.starts_with(SYSTEM_FIELD_PREFIX)
}

pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

pub fn format_timestamp(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

const NAIVE_DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse user input into an instant. Accepts RFC 3339, zone-less date-times
/// (taken as UTC) and plain dates (midnight UTC).
pub fn parse_datetime_input(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    if let Some(ts) = parse_timestamp(value) {
        return Some(ts);
    }

    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Next `$updatedAt` stamp for a document last stamped at `previous`.
///
/// Strictly greater than `previous` even if the wall clock hasn't moved
/// (or moved backwards) since.
pub fn next_timestamp(previous: Option<&Value>) -> Timestamp {
    let now = Utc::now();
    match previous.and_then(Value::as_str).and_then(parse_timestamp) {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// User fields of a document, i.e. everything but the `$`-prefixed keys.
pub fn user_fields(document: &Document) -> Document {
    document
        .iter()
        .filter(|(key, _)| !is_system_field(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
