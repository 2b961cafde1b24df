use chrono::DateTime;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ParsedSidecar, RawRecord};

// Field names in order of preference. An object may carry several of them.
const NAME_KEYS: &[&str] = &["file_name", "imgName", "fileName", "filename"];
const TIMESTAMP_KEYS: &[&str] = &[
    "capture_timestamp",
    "originalCreationDate",
    "creationDate",
    "captureTimestamp",
];
const ID_KEYS: &[&str] = &[
    "original_identifier",
    "originalIdentifier",
    "id",
    "uuid",
    "fileChecksum",
];

/// Epoch values above this are taken to be milliseconds.
const MAX_EPOCH_SECS: i64 = 100_000_000_000;

fn has_name_key(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| NAME_KEYS.iter().any(|k| obj.contains_key(*k)))
}

/// First non-null value among `keys`.
fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn timestamp_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|v| {
                if v.abs() > MAX_EPOCH_SECS {
                    DateTime::from_timestamp_millis(v)
                } else {
                    DateTime::from_timestamp(v, 0)
                }
            })
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| n.to_string()),
        Some(other) => other.to_string(),
    }
}

fn identifier_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a JSON sidecar: one record object, or an array of them.
pub fn parse_json(text: &str) -> Result<ParsedSidecar, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let elements = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return Ok(ParsedSidecar::Unrecognized),
    };
    if !elements.iter().any(has_name_key) {
        return Ok(ParsedSidecar::Unrecognized);
    }

    let mut records = Vec::with_capacity(elements.len());
    let mut malformed = 0u64;
    for (i, element) in elements.into_iter().enumerate() {
        let row_no = i + 1;
        let Some(obj) = element.as_object() else {
            debug!(element = row_no, "json record is not an object");
            malformed += 1;
            continue;
        };
        let Some(name) = pick(obj, NAME_KEYS)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            debug!(element = row_no, "json record without a file name");
            malformed += 1;
            continue;
        };
        records.push(RawRecord {
            row: row_no,
            file_name: name.to_string(),
            timestamp: timestamp_text(pick(obj, TIMESTAMP_KEYS)),
            original_id: identifier_text(pick(obj, ID_KEYS)),
        });
    }

    Ok(ParsedSidecar::Recognized { records, malformed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_of_records() {
        let text = r#"[
            {"imgName": "IMG_0001.JPG", "originalCreationDate": "2023-01-02T15:45:00Z", "id": "A1"},
            {"fileName": "IMG_0002.MOV", "creationDate": 1672674300},
            {"fileName": ""},
            42,
            {"filename": "IMG_0003.JPG", "captureTimestamp": null, "uuid": 7}
        ]"#;
        let ParsedSidecar::Recognized { records, malformed } = parse_json(text).unwrap() else {
            panic!("expected recognised json");
        };
        assert_eq!(malformed, 2);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].original_id.as_deref(), Some("A1"));
        assert_eq!(records[1].timestamp, "2023-01-02T15:45:00+00:00");
        assert_eq!(records[1].row, 2);
        assert_eq!(records[2].timestamp, "");
        assert_eq!(records[2].original_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_several_aliases_in_one_object() {
        let text = r#"[
            {"imgName": "IMG_0001.JPG", "originalCreationDate": "2023-01-02T15:45:00Z", "id": "A1", "fileChecksum": "abc"},
            {"imgName": "IMG_0002.JPG", "fileName": "ignored.JPG", "creationDate": null, "captureTimestamp": "2023-01-03T08:00:00Z"}
        ]"#;
        let ParsedSidecar::Recognized { records, malformed } = parse_json(text).unwrap() else {
            panic!("expected recognised json");
        };
        assert_eq!(malformed, 0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_id.as_deref(), Some("A1"));
        assert_eq!(records[0].timestamp, "2023-01-02T15:45:00Z");
        assert_eq!(records[1].file_name, "IMG_0002.JPG");
        assert_eq!(records[1].timestamp, "2023-01-03T08:00:00Z");
    }

    #[test]
    fn test_single_object() {
        let text = r#"{"file_name": "a.jpg", "capture_timestamp": "2020-02-02 10:00:00"}"#;
        let ParsedSidecar::Recognized { records, .. } = parse_json(text).unwrap() else {
            panic!("expected recognised json");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "a.jpg");
    }

    #[test]
    fn test_foreign_json_is_unrecognized() {
        assert_eq!(
            parse_json(r#"{"albums": []}"#).unwrap(),
            ParsedSidecar::Unrecognized
        );
        assert_eq!(parse_json("[]").unwrap(), ParsedSidecar::Unrecognized);
        assert_eq!(parse_json("\"x\"").unwrap(), ParsedSidecar::Unrecognized);
        assert!(parse_json("{not json").is_err());
    }
}
