//! Pure coercions from loosely-typed legacy values to target column values.
//!
//! Every function returns `None` (or the documented default) on input it
//! cannot interpret, so one malformed field never aborts a record.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static GROUPED_INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d{1,3}([.,\s]\d{3})+$").expect("grouped integer regex"));

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Epoch values at or above this are treated as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Legacy status labels and their canonical target value. Keys are compared
/// after trimming and lowercasing.
const STATUS_TABLE: &[(&str, &str)] = &[
    ("active", "active"),
    ("hoạt động", "active"),
    ("dang hoat dong", "active"),
    ("đang hoạt động", "active"),
    ("inactive", "inactive"),
    ("ngừng hoạt động", "inactive"),
    ("ngung hoat dong", "inactive"),
    ("disabled", "inactive"),
    ("pending", "pending"),
    ("chờ duyệt", "pending"),
    ("cho duyet", "pending"),
    ("waiting", "pending"),
    ("approved", "approved"),
    ("đã duyệt", "approved"),
    ("entered", "entered"),
    ("vào bến", "entered"),
    ("vao ben", "entered"),
    ("in_station", "entered"),
    ("departed", "departed"),
    ("xuất bến", "departed"),
    ("xuat ben", "departed"),
    ("left", "departed"),
    ("cancelled", "cancelled"),
    ("canceled", "cancelled"),
    ("đã hủy", "cancelled"),
    ("huy", "cancelled"),
    ("paid", "paid"),
    ("đã thanh toán", "paid"),
    ("da thanh toan", "paid"),
    ("unpaid", "unpaid"),
    ("chưa thanh toán", "unpaid"),
    ("chua thanh toan", "unpaid"),
    ("expired", "expired"),
    ("hết hạn", "expired"),
    ("revoked", "revoked"),
    ("thu hồi", "revoked"),
];

/// Non-empty trimmed text from a string, number or boolean.
pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Keep digits and `+`; `None` when nothing is left.
pub fn clean_phone(value: &Value) -> Option<String> {
    let raw = coerce_string(value)?;
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Boolean from a bool, a number (non-zero is true) or a common spelling.
/// Anything else, including `null`, yields `default`.
pub fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "x" | "on" | "có" | "co" => true,
            "false" | "0" | "no" | "n" | "off" | "không" | "khong" => false,
            _ => default,
        },
        _ => default,
    }
}

/// Integer from a number or numeric string; grouped thousands such as
/// `1.500.000` or `1,500,000` are accepted.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(parsed) = trimmed.parse::<i64>() {
                return Some(parsed);
            }
            if GROUPED_INTEGER.is_match(trimmed) {
                let digits: String = trimmed
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '-')
                    .collect();
                return digits.parse().ok();
            }
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }
        _ => None,
    }
}

pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .or_else(|| coerce_i64(value).map(|i| i as f64))
        }
        _ => None,
    }
}

fn epoch_to_datetime(raw: i64) -> Option<DateTime<Utc>> {
    if raw.unsigned_abs() >= MILLIS_THRESHOLD.unsigned_abs() {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

/// Permissive timestamp parsing: RFC 3339, common local formats (read as
/// UTC), epoch seconds or milliseconds, and `{ "_seconds": n }` objects.
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(epoch_to_datetime),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(parsed.with_timezone(&Utc));
            }
            for format in DATETIME_FORMATS {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
                    return Some(parsed.and_utc());
                }
            }
            for format in DATE_FORMATS {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, format) {
                    return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
                }
            }
            if trimmed.chars().all(|c| c.is_ascii_digit()) {
                return trimmed.parse::<i64>().ok().and_then(epoch_to_datetime);
            }
            None
        }
        Value::Object(map) => map
            .get("_seconds")
            .or_else(|| map.get("seconds"))
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        for format in DATE_FORMATS {
            if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, format) {
                return Some(parsed);
            }
        }
    }
    parse_datetime(value).map(|dt| dt.date_naive())
}

/// Storage form of a timestamp column.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Storage form of a date column.
pub fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

/// Canonical lowercase status. Unknown labels fall back to their own
/// trimmed lowercase spelling.
pub fn canonical_status(raw: &str) -> String {
    let key = raw.trim().to_lowercase();
    STATUS_TABLE
        .iter()
        .find(|(label, _)| *label == key)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(key)
}

/// Cut `value` to at most `max` characters. Returns whether it was cut.
pub fn truncate_chars(value: &mut String, max: usize) -> bool {
    match value.char_indices().nth(max) {
        Some((byte_index, _)) => {
            value.truncate(byte_index);
            true
        }
        None => false,
    }
}

/// Plate numbers compare equal regardless of case, spaces and dots:
/// `51b-123.45` and ` 51B-12345` both become `51B-12345`.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Codes and document numbers: trimmed, inner whitespace collapsed, uppercase.
pub fn normalize_code(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
