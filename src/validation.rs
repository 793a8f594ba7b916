//! Input validation for Schedule Core.
//!
//! This module provides validation functions for user inputs and identifiers.
//! All validators return ScheduleError::Validation on failure.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{ScheduleError, ScheduleResult};

pub const MAX_RECORD_NUMBER_LENGTH: usize = 64;
pub const MAX_NAME_LENGTH: usize = 200;
pub const MAX_REMOVAL_REASON_LENGTH: usize = 500;
pub const MAX_EVENT_TYPES: usize = 32;
/// Upper bound for a single note or drawing payload (serialized JSON)
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Legacy datetime format accepted at the sync boundary
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date format used by schedule drawings
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Validate and convert a UUID hex string to Uuid.
pub fn validate_uuid_hex(value: &str, field_name: &str) -> ScheduleResult<Uuid> {
    // Accept both hyphenated and non-hyphenated formats
    let cleaned = value.replace('-', "");
    Uuid::parse_str(&cleaned).map_err(|e| {
        ScheduleError::validation(field_name, format!("invalid UUID format: {}", e))
    })
}

/// Convert UUID to hex string (32 chars, no hyphens).
pub fn uuid_to_hex(value: &Uuid) -> String {
    value.simple().to_string()
}

/// Validate an entity ID and return its canonical hex form.
pub fn validate_entity_id(entity_id: &str, field_name: &str) -> ScheduleResult<String> {
    validate_uuid_hex(entity_id, field_name).map(|u| uuid_to_hex(&u))
}

/// Validate a device ID.
pub fn validate_device_id(device_id: &str) -> ScheduleResult<String> {
    validate_entity_id(device_id, "device_id")
}

/// Validate a record number (the person-identifying number on an event).
pub fn validate_record_number(record_number: &str) -> ScheduleResult<()> {
    let trimmed = record_number.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::validation("record_number", "cannot be empty"));
    }
    if trimmed.len() > MAX_RECORD_NUMBER_LENGTH {
        return Err(ScheduleError::validation(
            "record_number",
            format!("exceeds maximum length of {} characters", MAX_RECORD_NUMBER_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a book name.
pub fn validate_book_name(name: &str) -> ScheduleResult<()> {
    if name.trim().is_empty() {
        return Err(ScheduleError::validation("name", "book name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ScheduleError::validation(
            "name",
            format!("exceeds maximum length of {} characters", MAX_NAME_LENGTH),
        ));
    }
    Ok(())
}

/// Validate the reason given when removing an event.
pub fn validate_removal_reason(reason: &str) -> ScheduleResult<()> {
    if reason.trim().is_empty() {
        return Err(ScheduleError::validation(
            "removal_reason",
            "a reason is required to remove an event",
        ));
    }
    if reason.len() > MAX_REMOVAL_REASON_LENGTH {
        return Err(ScheduleError::validation(
            "removal_reason",
            format!("exceeds maximum length of {} characters", MAX_REMOVAL_REASON_LENGTH),
        ));
    }
    Ok(())
}

/// Validate an event time range (end, when present, must not precede start).
pub fn validate_time_range(start_at: i64, end_at: Option<i64>) -> ScheduleResult<()> {
    if let Some(end) = end_at {
        if end < start_at {
            return Err(ScheduleError::validation(
                "end_at",
                "event cannot end before it starts",
            ));
        }
    }
    Ok(())
}

/// Validate a list of event types.
pub fn validate_event_types(types: &[String]) -> ScheduleResult<()> {
    if types.len() > MAX_EVENT_TYPES {
        return Err(ScheduleError::validation(
            "event_types",
            format!("at most {} event types allowed", MAX_EVENT_TYPES),
        ));
    }
    for (i, t) in types.iter().enumerate() {
        if t.trim().is_empty() {
            return Err(ScheduleError::validation(
                "event_types",
                format!("item {}: cannot be empty", i),
            ));
        }
    }
    Ok(())
}

/// Validate a calendar date in `YYYY-MM-DD` form and return it canonicalized.
pub fn validate_date(value: &str, field_name: &str) -> ScheduleResult<String> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map(|d| d.format(DATE_FORMAT).to_string())
        .map_err(|e| {
            ScheduleError::validation(field_name, format!("expected YYYY-MM-DD: {}", e))
        })
}

/// Validate the serialized size of a note or drawing payload.
pub fn validate_payload_size(payload: &str, field_name: &str) -> ScheduleResult<()> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ScheduleError::validation(
            field_name,
            format!(
                "payload exceeds maximum size of {} bytes (got {})",
                MAX_PAYLOAD_BYTES,
                payload.len()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_uuid_hex_valid() {
        let uuid = Uuid::now_v7();
        let hex = uuid.simple().to_string();
        assert_eq!(validate_uuid_hex(&hex, "test").unwrap(), uuid);
    }

    #[test]
    fn test_validate_entity_id_canonicalizes_hyphens() {
        let uuid = Uuid::now_v7();
        let hyphenated = uuid.hyphenated().to_string();
        assert_eq!(
            validate_entity_id(&hyphenated, "id").unwrap(),
            uuid.simple().to_string()
        );
    }

    #[test]
    fn test_validate_uuid_hex_invalid() {
        assert!(validate_uuid_hex("not-a-uuid", "test").is_err());
    }

    #[test]
    fn test_validate_removal_reason() {
        assert!(validate_removal_reason("patient cancelled").is_ok());
        assert!(matches!(
            validate_removal_reason(""),
            Err(ScheduleError::Validation { .. })
        ));
        assert!(validate_removal_reason("   ").is_err());
        assert!(validate_removal_reason(&"x".repeat(MAX_REMOVAL_REASON_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_record_number() {
        assert!(validate_record_number("A-1001").is_ok());
        assert!(validate_record_number("").is_err());
        assert!(validate_record_number(&"9".repeat(MAX_RECORD_NUMBER_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_time_range() {
        assert!(validate_time_range(10, Some(20)).is_ok());
        assert!(validate_time_range(10, None).is_ok());
        assert!(validate_time_range(20, Some(10)).is_err());
    }

    #[test]
    fn test_validate_date() {
        assert_eq!(validate_date("2025-03-09", "date").unwrap(), "2025-03-09");
        assert!(validate_date("2025-13-01", "date").is_err());
        assert!(validate_date("09/03/2025", "date").is_err());
    }

    #[test]
    fn test_validate_event_types() {
        assert!(validate_event_types(&["checkup".to_string()]).is_ok());
        assert!(validate_event_types(&["".to_string()]).is_err());
    }
}
