//! Data models for Schedule Core.
//!
//! This module defines the syncable entities (Record, Book, Event, Note,
//! ScheduleDrawing), the client-only cache policy, the server audit log and
//! the sync wire types. IDs are UUID7 hex strings (32 chars, no hyphens);
//! all timestamps are Unix milliseconds.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a new entity ID (UUID7 hex)
pub fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// The syncable tables, in dependency order (parents first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Records,
    Books,
    Events,
    Notes,
    ScheduleDrawings,
}

impl SyncTable {
    pub const ALL: [SyncTable; 5] = [
        SyncTable::Records,
        SyncTable::Books,
        SyncTable::Events,
        SyncTable::Notes,
        SyncTable::ScheduleDrawings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTable::Records => "records",
            SyncTable::Books => "books",
            SyncTable::Events => "events",
            SyncTable::Notes => "notes",
            SyncTable::ScheduleDrawings => "schedule_drawings",
        }
    }

    /// Parse a wire table name. Unknown names are rejected by the caller.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "records" => Some(SyncTable::Records),
            "books" => Some(SyncTable::Books),
            "events" => Some(SyncTable::Events),
            "notes" => Some(SyncTable::Notes),
            "schedule_drawings" => Some(SyncTable::ScheduleDrawings),
            _ => None,
        }
    }

    /// Column holding the sync id of a row
    pub fn key_column(&self) -> &'static str {
        match self {
            SyncTable::Notes => "record_id",
            SyncTable::ScheduleDrawings => "drawing_key",
            _ => "id",
        }
    }

    /// Tables whose rows carry client-side cache metadata
    pub fn is_cacheable(&self) -> bool {
        matches!(self, SyncTable::Notes | SyncTable::ScheduleDrawings)
    }

    /// Column whose length is counted against the cache size budget
    pub fn payload_column(&self) -> Option<&'static str> {
        match self {
            SyncTable::Notes => Some("pages"),
            SyncTable::ScheduleDrawings => Some("strokes"),
            _ => None,
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar view a drawing belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Day,
    Week,
    Month,
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Day => "day",
            ViewMode::Week => "week",
            ViewMode::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "day" | "0" => Some(ViewMode::Day),
            "week" | "1" => Some(ViewMode::Week),
            "month" | "2" => Some(ViewMode::Month),
            _ => None,
        }
    }
}

/// Build the sync id of a schedule drawing from its composite key.
pub fn drawing_key(book_id: &str, date: &str, view_mode: ViewMode) -> String {
    format!("{}:{}:{}", book_id, date, view_mode.as_str())
}

/// A person identity. Canonical anchor for notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub record_number: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl Record {
    pub fn new(record_number: String, name: Option<String>, phone: Option<String>) -> Self {
        Self {
            id: new_id(),
            record_number,
            name,
            phone,
            version: 0,
            is_dirty: true,
            is_deleted: false,
        }
    }
}

/// A container of events and drawings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub name: String,
    pub archived_at: Option<i64>,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl Book {
    pub fn new(name: String) -> Self {
        Self {
            id: new_id(),
            name,
            archived_at: None,
            version: 0,
            is_dirty: true,
            is_deleted: false,
        }
    }
}

/// One scheduled occurrence for a record inside a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub book_id: String,
    pub record_id: String,
    pub title: Option<String>,
    pub start_at: i64,
    pub end_at: Option<i64>,
    pub event_types: Vec<String>,
    pub is_removed: bool,
    pub removal_reason: Option<String>,
    /// Event this one superseded (set on the replacement)
    pub original_event_id: Option<String>,
    /// Event that superseded this one (set on the removed original)
    pub new_event_id: Option<String>,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl Event {
    pub fn new(book_id: String, record_id: String, start_at: i64, end_at: Option<i64>) -> Self {
        Self {
            id: new_id(),
            book_id,
            record_id,
            title: None,
            start_at,
            end_at,
            event_types: Vec::new(),
            is_removed: false,
            removal_reason: None,
            original_event_id: None,
            new_event_id: None,
            version: 0,
            is_dirty: true,
            is_deleted: false,
        }
    }
}

/// Canonical per-record handwritten note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub record_id: String,
    /// Pages of strokes, opaque to the sync engine
    pub pages: serde_json::Value,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
    pub locked_by_device_id: Option<String>,
    pub locked_at: Option<i64>,
}

impl Note {
    /// True when the note holds at least one non-empty page
    pub fn has_content(&self) -> bool {
        pages_have_content(&self.pages)
    }
}

/// Whether a pages payload carries any content.
///
/// Accepts either a list of pages (each page a list of strokes or an object
/// with a `strokes` list) or a single object.
pub fn pages_have_content(pages: &serde_json::Value) -> bool {
    match pages {
        serde_json::Value::Null => false,
        serde_json::Value::Array(items) => items.iter().any(|page| match page {
            serde_json::Value::Array(strokes) => !strokes.is_empty(),
            serde_json::Value::Object(obj) => obj
                .get("strokes")
                .map(pages_have_content)
                .unwrap_or(!obj.is_empty()),
            serde_json::Value::Null => false,
            _ => true,
        }),
        serde_json::Value::Object(obj) => !obj.is_empty(),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Per (book, date, view) canvas snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDrawing {
    pub book_id: String,
    pub date: String,
    pub view_mode: ViewMode,
    pub strokes: serde_json::Value,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl ScheduleDrawing {
    pub fn key(&self) -> String {
        drawing_key(&self.book_id, &self.date, self.view_mode)
    }
}

/// Client-only cache policy (single row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicy {
    pub max_cache_size_mb: i64,
    pub cache_duration_days: i64,
    pub auto_cleanup: bool,
    pub last_cleanup_at: Option<i64>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_cache_size_mb: 50,
            cache_duration_days: 7,
            auto_cleanup: true,
            last_cleanup_at: None,
        }
    }
}

impl CachePolicy {
    pub fn max_cache_size_bytes(&self) -> i64 {
        self.max_cache_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Outcome recorded in the server audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    Success,
    Conflict,
    Failure,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogStatus::Success => "success",
            SyncLogStatus::Conflict => "conflict",
            SyncLogStatus::Failure => "failure",
        }
    }
}

/// Server audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub device_id: String,
    pub operation: String,
    pub table_name: String,
    pub record_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

/// Generic view of one syncable row: sync metadata plus the whitelisted
/// domain columns as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub table: SyncTable,
    pub record_id: String,
    pub version: i64,
    pub is_dirty: bool,
    pub is_deleted: bool,
    pub local_rev: i64,
    pub updated_at: i64,
    pub data: serde_json::Value,
}

/// Explicit device credentials passed to every sync and lock call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub device_id: String,
    pub device_token: String,
}

impl DeviceSession {
    pub fn new(device_id: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_token: device_token.into(),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Kind of change carried by a SyncChange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

/// One entity change on the wire (push and pull).
///
/// `version` is the version the sender last observed for the entity. On
/// pull it is the server's current version. `data` and `timestamp` may
/// arrive in loose shapes; they are normalized at the service boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub table: String,
    pub record_id: String,
    pub operation: SyncOperation,
    #[serde(default)]
    pub data: serde_json::Value,
    pub version: i64,
    #[serde(default)]
    pub timestamp: serde_json::Value,
}

/// Structured version conflict, returned instead of mutating server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub table: String,
    pub record_id: String,
    pub local_data: serde_json::Value,
    pub server_data: serde_json::Value,
    pub local_version: i64,
    pub server_version: i64,
    pub local_timestamp: i64,
    pub server_timestamp: i64,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: local version {}, server version {}",
            self.table, self.record_id, self.local_version, self.server_version
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub device_token: String,
    pub changes: Vec<SyncChange>,
}

/// Acknowledgement of one applied change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub table: String,
    pub record_id: String,
    pub version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub applied_count: i64,
    #[serde(default)]
    pub applied: Vec<AppliedChange>,
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub device_id: String,
    pub device_token: String,
    pub last_sync_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<SyncChange>,
    /// Cursor to send as `lastSyncAt` on the next pull
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchNoteWrite {
    pub record_ref: String,
    pub data: serde_json::Value,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDrawingWrite {
    pub book_ref: String,
    pub date: String,
    pub view_mode: String,
    pub data: serde_json::Value,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveRequest {
    pub device_id: String,
    pub device_token: String,
    #[serde(default)]
    pub notes: Vec<BatchNoteWrite>,
    #[serde(default)]
    pub drawings: Vec<BatchDrawingWrite>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub succeeded: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResults {
    pub notes: BatchCounts,
    pub drawings: BatchCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BatchResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BatchSaveResponse {
    pub fn succeeded(results: BatchResults) -> Self {
        Self {
            success: true,
            results: Some(results),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            results: None,
            error_message: Some(message.into()),
        }
    }
}

/// Server-side conflict resolution choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UseLocal,
    UseServer,
    Merge,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "use_local" | "local" => Some(Resolution::UseLocal),
            "use_server" | "server" => Some(Resolution::UseServer),
            "merge" => Some(Resolution::Merge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::UseLocal => "use_local",
            Resolution::UseServer => "use_server",
            Resolution::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub device_id: String,
    pub device_token: String,
    pub table: String,
    pub record_id: String,
    pub resolution: Resolution,
    #[serde(default)]
    pub merged_data: Option<serde_json::Value>,
    #[serde(default)]
    pub local_data: Option<serde_json::Value>,
}

/// Authoritative row returned after a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRecord {
    pub table: String,
    pub record_id: String,
    pub version: i64,
    pub data: serde_json::Value,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub device_id: String,
    pub device_token: String,
    pub record_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAcquireResponse {
    pub acquired: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatusResponse {
    pub locked_by_other: bool,
}

/// Ask for one row by sync id, e.g. to refill an evicted cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub device_id: String,
    pub device_token: String,
    pub table: String,
    pub record_id: String,
}

/// The server's current row, absent when it never held one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub change: Option<SyncChange>,
}
