//! Column-kind driven conversion between SQLite values and artifact JSON.
//!
//! Export turns UUID columns into canonical hyphenated strings and timestamps into
//! RFC 3339 UTC; restore parses them back and rejects values that don't fit the
//! declared column type.
//!
//! UUIDs are always written back lowercase. Lookups against live rows compare
//! UUID columns through `lower()` so older uppercase text still matches.

use crate::services::backup::schema::{Column, ColumnKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};
use uuid::Uuid;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses the timestamp shapes SQLite and the application write. Naive values are UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // "2024-01-01 10:00:00+00:00" is not RFC 3339 but SQLite happily stores it
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn normalize_datetime(raw: &str) -> Option<String> {
    parse_datetime(raw).map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(raw).map(|dt| dt.date_naive()))
        .map(|d| d.format("%Y-%m-%d").to_string())
}

/// Serializes one stored value for an artifact. Values that don't parse as their
/// declared kind are passed through unchanged.
pub fn to_json(column: &Column, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let normalized = match column.kind {
                ColumnKind::Uuid => Uuid::parse_str(&text).ok().map(|u| u.to_string()),
                ColumnKind::DateTime => normalize_datetime(&text),
                ColumnKind::Date => normalize_date(&text),
                ColumnKind::Blob | ColumnKind::Other => None,
            };
            Value::String(normalized.unwrap_or_else(|| text.into_owned()))
        }
        ValueRef::Blob(bytes) => match (column.kind, Uuid::from_slice(bytes)) {
            (ColumnKind::Uuid, Ok(uuid)) => Value::String(uuid.to_string()),
            _ => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        },
    }
}

/// Converts an artifact value back into the column's native representation.
pub fn to_sql(column: &Column, value: &Value) -> Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlValue::Integer(i)),
            None => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| format!("column {} has an unrepresentable number", column.name)),
        },
        Value::String(s) => match column.kind {
            ColumnKind::Uuid => Uuid::parse_str(s)
                .map(|u| SqlValue::Text(u.to_string()))
                .map_err(|_| format!("column {} expects a UUID, got '{s}'", column.name)),
            ColumnKind::DateTime => normalize_datetime(s)
                .map(SqlValue::Text)
                .ok_or_else(|| format!("column {} expects a timestamp, got '{s}'", column.name)),
            ColumnKind::Date => normalize_date(s)
                .map(SqlValue::Text)
                .ok_or_else(|| format!("column {} expects a date, got '{s}'", column.name)),
            ColumnKind::Blob | ColumnKind::Other => Ok(SqlValue::Text(s.clone())),
        },
        Value::Array(items) if column.kind == ColumnKind::Blob => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(SqlValue::Blob)
            .ok_or_else(|| format!("column {} expects a byte array", column.name)),
        other => Ok(SqlValue::Text(other.to_string())),
    }
}

/// Comparison key for FK closure checks; `None` for SQL NULL.
pub fn match_key(column: Option<&Column>, value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => {
            if column.map(|c| c.kind) == Some(ColumnKind::Uuid) {
                if let Ok(uuid) = Uuid::parse_str(s) {
                    return Some(uuid.to_string());
                }
            }
            Some(s.clone())
        }
        Value::Bool(b) => Some(i64::from(*b).to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
