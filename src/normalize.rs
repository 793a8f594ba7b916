//! Boundary adapter for inbound sync payloads.
//!
//! Everything that arrives over the wire passes through here exactly once.
//! Tables and columns are checked against a whitelist, and loosely typed
//! values (timestamps as seconds, milliseconds or strings, booleans as
//! integers or strings, lists as arrays or JSON-encoded strings) are decoded
//! into one strict SQL representation. Anything unrecognized is rejected
//! before the store is touched.

use chrono::{DateTime, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{drawing_key, now_ms, SyncChange, SyncOperation, SyncTable, ViewMode};
use crate::validation::{
    validate_date, validate_entity_id, validate_payload_size, DATETIME_FORMAT,
};

/// Integers below this are read as seconds, at or above as milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

/// Strict storage type of a syncable column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Id,
    Timestamp,
    Bool,
    /// JSON array of strings, stored as canonical JSON text
    JsonList,
    /// Arbitrary JSON array/object payload, stored as canonical JSON text
    Json,
    Date,
    ViewMode,
}

/// Whitelisted column of a syncable table
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

const fn col(name: &'static str, kind: ColumnKind, required: bool) -> ColumnSpec {
    ColumnSpec { name, kind, required }
}

static RECORD_COLUMNS: &[ColumnSpec] = &[
    col("record_number", ColumnKind::Text, true),
    col("name", ColumnKind::Text, false),
    col("phone", ColumnKind::Text, false),
];

static BOOK_COLUMNS: &[ColumnSpec] = &[
    col("name", ColumnKind::Text, true),
    col("archived_at", ColumnKind::Timestamp, false),
];

static EVENT_COLUMNS: &[ColumnSpec] = &[
    col("book_id", ColumnKind::Id, true),
    col("record_id", ColumnKind::Id, true),
    col("title", ColumnKind::Text, false),
    col("start_at", ColumnKind::Timestamp, true),
    col("end_at", ColumnKind::Timestamp, false),
    col("event_types", ColumnKind::JsonList, false),
    col("is_removed", ColumnKind::Bool, false),
    col("removal_reason", ColumnKind::Text, false),
    col("original_event_id", ColumnKind::Id, false),
    col("new_event_id", ColumnKind::Id, false),
];

static NOTE_COLUMNS: &[ColumnSpec] = &[col("pages", ColumnKind::Json, true)];

static DRAWING_COLUMNS: &[ColumnSpec] = &[
    col("book_id", ColumnKind::Id, true),
    col("date", ColumnKind::Date, true),
    col("view_mode", ColumnKind::ViewMode, true),
    col("strokes", ColumnKind::Json, true),
];

/// The synced domain columns of a table. Sync metadata (version, dirty and
/// tombstone flags) and client cache metadata are never in this list.
pub fn columns(table: SyncTable) -> &'static [ColumnSpec] {
    match table {
        SyncTable::Records => RECORD_COLUMNS,
        SyncTable::Books => BOOK_COLUMNS,
        SyncTable::Events => EVENT_COLUMNS,
        SyncTable::Notes => NOTE_COLUMNS,
        SyncTable::ScheduleDrawings => DRAWING_COLUMNS,
    }
}

/// A change that passed the boundary checks
#[derive(Debug, Clone)]
pub struct NormalizedChange {
    pub table: SyncTable,
    pub record_id: String,
    pub operation: SyncOperation,
    pub expected_version: i64,
    pub timestamp: i64,
    /// Whitelisted columns in declaration order; empty for deletes
    pub columns: Vec<(&'static str, SqlValue)>,
    /// Canonical JSON rendering of `columns`
    pub data: Value,
}

/// Resolve a wire table name against the whitelist.
pub fn parse_table(name: &str) -> ScheduleResult<SyncTable> {
    SyncTable::parse(name)
        .ok_or_else(|| ScheduleError::validation("table", format!("unknown table '{}'", name)))
}

/// Validate and canonicalize the sync id of a row.
pub fn normalize_record_id(table: SyncTable, record_id: &str) -> ScheduleResult<String> {
    match table {
        SyncTable::ScheduleDrawings => {
            let (book_id, date, view_mode) = split_drawing_key(record_id)?;
            Ok(drawing_key(&book_id, &date, view_mode))
        }
        _ => validate_entity_id(record_id, "record_id"),
    }
}

/// Split a drawing sync id into (book_id, date, view_mode).
pub fn split_drawing_key(key: &str) -> ScheduleResult<(String, String, ViewMode)> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 3 {
        return Err(ScheduleError::validation(
            "record_id",
            format!("drawing id must be 'book:date:view', got '{}'", key),
        ));
    }
    let book_id = validate_entity_id(parts[0], "record_id")?;
    let date = validate_date(parts[1], "record_id")?;
    let view_mode = ViewMode::parse(parts[2]).ok_or_else(|| {
        ScheduleError::validation("record_id", format!("unknown view mode '{}'", parts[2]))
    })?;
    Ok((book_id, date, view_mode))
}

/// Normalize one wire change.
pub fn normalize_change(change: &SyncChange) -> ScheduleResult<NormalizedChange> {
    let table = parse_table(&change.table)?;
    let record_id = normalize_record_id(table, &change.record_id)?;

    if change.version < 0 {
        return Err(ScheduleError::validation("version", "cannot be negative"));
    }

    let timestamp = match &change.timestamp {
        Value::Null => now_ms(),
        other => coerce_timestamp(other, "timestamp")?,
    };

    let columns = match change.operation {
        SyncOperation::Delete => Vec::new(),
        SyncOperation::Update => normalize_data(table, &record_id, &change.data)?,
    };
    let data = columns_to_json(table, &columns);

    Ok(NormalizedChange {
        table,
        record_id,
        operation: change.operation,
        expected_version: change.version,
        timestamp,
        columns,
        data,
    })
}

/// Normalize the `data` object of an update into whitelisted SQL values.
pub fn normalize_data(
    table: SyncTable,
    record_id: &str,
    data: &Value,
) -> ScheduleResult<Vec<(&'static str, SqlValue)>> {
    let obj = match data {
        Value::Object(obj) => obj,
        Value::String(s) => {
            // Some clients send the row JSON-encoded
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| ScheduleError::validation("data", format!("invalid JSON: {}", e)))?;
            return normalize_data(table, record_id, &parsed);
        }
        _ => return Err(ScheduleError::validation("data", "must be a JSON object")),
    };

    let specs = columns(table);
    for key in obj.keys() {
        if specs.iter().any(|s| s.name == key) {
            continue;
        }
        // The sync id may be echoed inside the row; it must agree.
        if matches!(key.as_str(), "id" | "record_id" | "drawing_key") {
            let echoed = obj.get(key).and_then(|v| v.as_str());
            if echoed.and_then(|e| normalize_record_id(table, e).ok()).as_deref() == Some(record_id)
            {
                continue;
            }
        }
        return Err(ScheduleError::validation(
            "data",
            format!("unknown field '{}' for table {}", key, table),
        ));
    }

    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let value = obj.get(spec.name).unwrap_or(&Value::Null);
        out.push((spec.name, normalize_value(spec, value)?));
    }

    // A drawing row must describe the same slot as its key.
    if table == SyncTable::ScheduleDrawings {
        let (book_id, date, view_mode) = split_drawing_key(record_id)?;
        let expect = [
            ("book_id", book_id),
            ("date", date),
            ("view_mode", view_mode.as_str().to_string()),
        ];
        for (name, expected) in expect {
            let actual = out.iter().find(|(n, _)| *n == name).map(|(_, v)| v);
            if actual != Some(&SqlValue::Text(expected.clone())) {
                return Err(ScheduleError::validation(
                    name,
                    format!("does not match drawing id {}", record_id),
                ));
            }
        }
    }

    Ok(out)
}

/// Normalize a single column value.
pub fn normalize_value(spec: &ColumnSpec, value: &Value) -> ScheduleResult<SqlValue> {
    if value.is_null() {
        if spec.required {
            return Err(ScheduleError::validation(spec.name, "is required"));
        }
        return Ok(match spec.kind {
            ColumnKind::Bool => SqlValue::Integer(0),
            ColumnKind::JsonList => SqlValue::Text("[]".to_string()),
            _ => SqlValue::Null,
        });
    }

    match spec.kind {
        ColumnKind::Text => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            _ => Err(ScheduleError::validation(spec.name, "expected text")),
        },
        ColumnKind::Id => match value {
            Value::String(s) => Ok(SqlValue::Text(validate_entity_id(s, spec.name)?)),
            _ => Err(ScheduleError::validation(spec.name, "expected an id string")),
        },
        ColumnKind::Timestamp => Ok(SqlValue::Integer(coerce_timestamp(value, spec.name)?)),
        ColumnKind::Bool => Ok(SqlValue::Integer(coerce_bool(value, spec.name)? as i64)),
        ColumnKind::JsonList => Ok(SqlValue::Text(coerce_string_list(value, spec.name)?)),
        ColumnKind::Json => Ok(SqlValue::Text(coerce_json_payload(value, spec.name)?)),
        ColumnKind::Date => match value {
            Value::String(s) => Ok(SqlValue::Text(validate_date(s, spec.name)?)),
            _ => Err(ScheduleError::validation(spec.name, "expected YYYY-MM-DD")),
        },
        ColumnKind::ViewMode => {
            let parsed = match value {
                Value::String(s) => ViewMode::parse(s),
                Value::Number(n) => n.as_i64().and_then(|i| ViewMode::parse(&i.to_string())),
                _ => None,
            };
            parsed
                .map(|v| SqlValue::Text(v.as_str().to_string()))
                .ok_or_else(|| ScheduleError::validation(spec.name, "unknown view mode"))
        }
    }
}

/// Decode a timestamp in any accepted shape into Unix milliseconds.
///
/// Values that do not land on a representable calendar instant are rejected.
pub fn coerce_timestamp(value: &Value, field: &str) -> ScheduleResult<i64> {
    let millis = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                scale_epoch(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.is_finite()) {
                let ms = if f.abs() < SECONDS_CUTOFF as f64 { f * 1000.0 } else { f };
                // Saturating cast; the range check below rejects the extremes
                Some(ms.round() as i64)
            } else {
                None
            }
        }
        Value::String(s) => {
            return parse_timestamp_str(s.trim())
                .ok_or_else(|| ScheduleError::validation(field, format!("unrecognized timestamp '{}'", s)));
        }
        _ => return Err(ScheduleError::validation(field, "expected a timestamp")),
    };
    millis
        .filter(|ms| DateTime::from_timestamp_millis(*ms).is_some())
        .ok_or_else(|| ScheduleError::validation(field, "timestamp out of range"))
}

fn scale_epoch(i: i64) -> Option<i64> {
    if i.checked_abs()? < SECONDS_CUTOFF {
        i.checked_mul(1000)
    } else {
        Some(i)
    }
}

fn parse_timestamp_str(s: &str) -> Option<i64> {
    if let Ok(i) = s.parse::<i64>() {
        return scale_epoch(i).filter(|ms| DateTime::from_timestamp_millis(*ms).is_some());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT) {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    None
}

/// Decode a boolean from bool, 0/1 or a "true"/"false"/"0"/"1" string.
pub fn coerce_bool(value: &Value, field: &str) -> ScheduleResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ScheduleError::validation(field, "expected 0 or 1")),
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ScheduleError::validation(field, format!("unrecognized boolean '{}'", s))),
        },
        _ => Err(ScheduleError::validation(field, "expected a boolean")),
    }
}

/// Decode a list of strings from an array or a JSON-encoded array string.
pub fn coerce_string_list(value: &Value, field: &str) -> ScheduleResult<String> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) if s.trim().is_empty() => Vec::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => return Err(ScheduleError::validation(field, "expected a JSON list")),
        },
        _ => return Err(ScheduleError::validation(field, "expected a list")),
    };

    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => strings.push(s),
            Value::Number(n) => strings.push(n.to_string()),
            _ => return Err(ScheduleError::validation(field, "list items must be strings")),
        }
    }
    Ok(serde_json::to_string(&strings)?)
}

/// Decode a note/drawing payload (array or object, possibly JSON-encoded).
pub fn coerce_json_payload(value: &Value, field: &str) -> ScheduleResult<String> {
    let parsed = match value {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| ScheduleError::validation(field, format!("invalid JSON payload: {}", e)))?,
        other => other.clone(),
    };
    if !(parsed.is_array() || parsed.is_object()) {
        return Err(ScheduleError::validation(field, "payload must be a JSON array or object"));
    }
    let text = serde_json::to_string(&parsed)?;
    validate_payload_size(&text, field)?;
    Ok(text)
}

/// Render one stored SQL value back to its JSON wire form.
pub fn sql_to_json(kind: ColumnKind, value: &SqlValue) -> Value {
    match (kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(*i != 0),
        (ColumnKind::JsonList | ColumnKind::Json, SqlValue::Text(s)) => {
            serde_json::from_str(s).unwrap_or(Value::Null)
        }
        (_, SqlValue::Integer(i)) => Value::from(*i),
        (_, SqlValue::Real(f)) => Value::from(*f),
        (_, SqlValue::Text(s)) => Value::String(s.clone()),
        (_, SqlValue::Blob(_)) => Value::Null,
    }
}

/// Render a set of normalized columns as a JSON object.
pub fn columns_to_json(table: SyncTable, values: &[(&'static str, SqlValue)]) -> Value {
    let mut obj = serde_json::Map::new();
    for spec in columns(table) {
        if let Some((_, v)) = values.iter().find(|(n, _)| *n == spec.name) {
            obj.insert(spec.name.to_string(), sql_to_json(spec.kind, v));
        }
    }
    Value::Object(obj)
}
