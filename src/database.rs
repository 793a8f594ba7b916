//! Database operations for Schedule Core.
//!
//! This module provides all data access functionality using SQLite.
//! The same schema backs both a device's local store and the authoritative
//! sync server: clients use the dirty flag, local revision counter and cache
//! metadata; the server uses the last-writer device, sync time and book
//! ownership columns.
//!
//! IDs are stored as TEXT (32 char UUID7 hex). All timestamps are Unix
//! milliseconds.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    drawing_key, now_ms, Book, EntityRow, Event, Note, Record, ScheduleDrawing,
    SyncLogEntry, SyncLogStatus, SyncTable, ViewMode,
};
use crate::normalize::{self, sql_to_json};
use crate::validation::{
    validate_book_name, validate_date, validate_event_types, validate_payload_size,
    validate_record_number, validate_removal_reason, validate_time_range,
};

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason stamped on an event superseded by a time change
pub const TIME_CHANGED_REASON: &str = "time changed";

/// Number of sync metadata columns selected ahead of the domain columns
const ENTITY_META_COLUMNS: usize = 6;

/// Client sync bookkeeping (single row)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub server_url: Option<String>,
    /// Server clock cursor returned by the last successful pull
    pub last_sync_at: Option<i64>,
    pub last_push_at: Option<i64>,
}

/// Version precondition for a server-side conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionGuard {
    /// Stored version must not be ahead of the caller's
    AtMost(i64),
    /// Stored version must equal the caller's
    Exactly(i64),
}

impl VersionGuard {
    fn clause(&self) -> (&'static str, i64) {
        match self {
            VersionGuard::AtMost(v) => ("version <= ?", *v),
            VersionGuard::Exactly(v) => ("version = ?", *v),
        }
    }
}

/// Server stamping for a write that arrived through sync
#[derive(Debug, Clone, Copy)]
pub struct SyncStamp<'a> {
    pub device_id: &'a str,
    /// Edit time reported by the device
    pub timestamp: i64,
    /// Server clock value at apply time
    pub synced_at: i64,
}

/// Hash a device token for storage and comparison.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> ScheduleResult<Self> {
        let conn = Connection::open(db_path)?;

        // WAL lets a reader proceed while another connection writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> ScheduleResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&self) -> ScheduleResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                record_number TEXT NOT NULL,
                name TEXT,
                phone TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_dirty INTEGER NOT NULL DEFAULT 0,
                local_rev INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                last_device_id TEXT
            );

            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                archived_at INTEGER,
                owner_device_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_dirty INTEGER NOT NULL DEFAULT 0,
                local_rev INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                last_device_id TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                record_id TEXT NOT NULL,
                title TEXT,
                start_at INTEGER NOT NULL,
                end_at INTEGER,
                event_types TEXT NOT NULL DEFAULT '[]',
                is_removed INTEGER NOT NULL DEFAULT 0,
                removal_reason TEXT,
                original_event_id TEXT,
                new_event_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_dirty INTEGER NOT NULL DEFAULT 0,
                local_rev INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                last_device_id TEXT
            );

            -- One note per record; the record id is the note's sync id
            CREATE TABLE IF NOT EXISTS notes (
                record_id TEXT PRIMARY KEY,
                pages TEXT NOT NULL DEFAULT '[]',
                locked_by_device_id TEXT,
                locked_at INTEGER,
                cached_at INTEGER,
                cache_hit_count INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_dirty INTEGER NOT NULL DEFAULT 0,
                local_rev INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                last_device_id TEXT
            );

            -- drawing_key is "{book_id}:{date}:{view_mode}"
            CREATE TABLE IF NOT EXISTS schedule_drawings (
                drawing_key TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                date TEXT NOT NULL,
                view_mode TEXT NOT NULL,
                strokes TEXT NOT NULL DEFAULT '[]',
                cached_at INTEGER,
                cache_hit_count INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_dirty INTEGER NOT NULL DEFAULT 0,
                local_rev INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                last_device_id TEXT,
                UNIQUE (book_id, date, view_mode)
            );

            CREATE TABLE IF NOT EXISTS cache_policy (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_cache_size_mb INTEGER NOT NULL DEFAULT 50,
                cache_duration_days INTEGER NOT NULL DEFAULT 7,
                auto_cleanup INTEGER NOT NULL DEFAULT 1,
                last_cleanup_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS evicted_rows (
                table_name TEXT NOT NULL,
                row_key TEXT NOT NULL,
                evicted_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, row_key)
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                server_url TEXT,
                last_sync_at INTEGER,
                last_push_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_data TEXT NOT NULL,
                server_data TEXT NOT NULL,
                local_version INTEGER NOT NULL,
                server_version INTEGER NOT NULL,
                local_timestamp INTEGER NOT NULL,
                server_timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                resolution TEXT
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                device_name TEXT,
                token_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                revoked_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS book_access (
                book_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                granted_at INTEGER NOT NULL,
                PRIMARY KEY (book_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                table_name TEXT NOT NULL,
                record_id TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_number ON records(record_number);
            CREATE INDEX IF NOT EXISTS idx_events_record ON events(record_id);
            CREATE INDEX IF NOT EXISTS idx_events_book ON events(book_id);
            CREATE INDEX IF NOT EXISTS idx_records_synced ON records(synced_at);
            CREATE INDEX IF NOT EXISTS idx_books_synced ON books(synced_at);
            CREATE INDEX IF NOT EXISTS idx_events_synced ON events(synced_at);
            CREATE INDEX IF NOT EXISTS idx_notes_synced ON notes(synced_at);
            CREATE INDEX IF NOT EXISTS idx_drawings_synced ON schedule_drawings(synced_at);
            CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
                ON sync_conflicts(table_name, record_id, resolved_at);

            INSERT OR IGNORE INTO cache_policy (id) VALUES (1);
            INSERT OR IGNORE INTO sync_state (id) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one transaction. Any error rolls back every write `f`
    /// made. Nested calls join the outer transaction.
    pub fn transaction<T, F>(&self, f: F) -> ScheduleResult<T>
    where
        F: FnOnce(&Database) -> ScheduleResult<T>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()
            .map_err(|e| ScheduleError::Transaction(e.to_string()))?;
        Ok(out)
    }

    /// Single compare-and-swap primitive.
    ///
    /// `sql` must be an `UPDATE ... WHERE <precondition> RETURNING <integer>`.
    /// Returns the returned value when the precondition held and the row was
    /// written, `None` when nothing matched. The check and the write are one
    /// statement, so concurrent callers cannot both observe success.
    pub fn conditional_update<P: Params>(&self, sql: &str, params: P) -> ScheduleResult<Option<i64>> {
        Ok(self.conn.query_row(sql, params, |row| row.get(0)).optional()?)
    }

    // ========================================================================
    // Schema metadata
    // ========================================================================

    pub fn get_meta(&self, key: &str) -> ScheduleResult<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM schema_meta WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> ScheduleResult<()> {
        self.conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Whether a table exists (used for legacy schema detection)
    pub fn table_exists(&self, table: &str) -> ScheduleResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Generic entity access
    // ========================================================================

    fn entity_select(table: SyncTable) -> String {
        let cols: Vec<&str> = normalize::columns(table).iter().map(|c| c.name).collect();
        format!(
            "SELECT {}, version, is_dirty, is_deleted, local_rev, updated_at, {} FROM {}",
            table.key_column(),
            cols.join(", "),
            table.as_str()
        )
    }

    fn row_to_entity(table: SyncTable, row: &Row) -> rusqlite::Result<EntityRow> {
        let mut data = serde_json::Map::new();
        for (i, spec) in normalize::columns(table).iter().enumerate() {
            let value: SqlValue = row.get(ENTITY_META_COLUMNS + i)?;
            data.insert(spec.name.to_string(), sql_to_json(spec.kind, &value));
        }
        Ok(EntityRow {
            table,
            record_id: row.get(0)?,
            version: row.get(1)?,
            is_dirty: row.get(2)?,
            is_deleted: row.get(3)?,
            local_rev: row.get(4)?,
            updated_at: row.get(5)?,
            data: serde_json::Value::Object(data),
        })
    }

    /// Read one row of any syncable table, tombstoned or not
    pub fn read_entity(&self, table: SyncTable, record_id: &str) -> ScheduleResult<Option<EntityRow>> {
        let sql = format!("{} WHERE {} = ?", Self::entity_select(table), table.key_column());
        Ok(self
            .conn
            .query_row(&sql, params![record_id], |row| Self::row_to_entity(table, row))
            .optional()?)
    }

    /// Query rows of a syncable table with a trailing SQL clause
    pub fn query_entities<P: Params>(
        &self,
        table: SyncTable,
        clause: &str,
        params: P,
    ) -> ScheduleResult<Vec<EntityRow>> {
        let sql = format!("{} {}", Self::entity_select(table), clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, |row| Self::row_to_entity(table, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows written through sync after `since`, excluding the caller's own
    /// writes. Ordered by server sync time.
    pub fn changed_since(
        &self,
        table: SyncTable,
        since: i64,
        exclude_device_id: &str,
    ) -> ScheduleResult<Vec<EntityRow>> {
        self.query_entities(
            table,
            "WHERE synced_at > ?1 AND (last_device_id IS NULL OR last_device_id != ?2)
             ORDER BY synced_at ASC",
            params![since, exclude_device_id],
        )
    }

    /// Highest server sync time across all tables (0 when empty)
    pub fn max_synced_at(&self) -> ScheduleResult<i64> {
        let mut max = 0;
        for table in SyncTable::ALL {
            let sql = format!("SELECT COALESCE(MAX(synced_at), 0) FROM {}", table.as_str());
            let value: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
            max = max.max(value);
        }
        Ok(max)
    }

    /// Insert a row that arrived from the server or through a push.
    ///
    /// The row is stored clean. `stamp` is set on the server only.
    pub fn insert_synced_entity(
        &self,
        table: SyncTable,
        record_id: &str,
        columns: &[(&'static str, SqlValue)],
        version: i64,
        is_deleted: bool,
        updated_at: i64,
        stamp: Option<SyncStamp<'_>>,
    ) -> ScheduleResult<()> {
        let mut names: Vec<&str> = vec![table.key_column()];
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(record_id.to_string())];
        for (name, value) in columns {
            names.push(name);
            values.push(value.clone());
        }
        let now = now_ms();
        names.extend(["version", "is_deleted", "is_dirty", "local_rev", "created_at", "updated_at"]);
        values.extend([
            SqlValue::Integer(version),
            SqlValue::Integer(is_deleted as i64),
            SqlValue::Integer(0),
            SqlValue::Integer(0),
            SqlValue::Integer(now),
            SqlValue::Integer(updated_at),
        ]);
        if let Some(stamp) = stamp {
            names.extend(["synced_at", "last_device_id"]);
            values.push(SqlValue::Integer(stamp.synced_at));
            values.push(SqlValue::Text(stamp.device_id.to_string()));
        } else if table.is_cacheable() {
            names.push("cached_at");
            values.push(SqlValue::Integer(now));
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.as_str(),
            names.join(", "),
            placeholders
        );
        self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    /// Server-side conditional write of a pushed update.
    ///
    /// Writes the columns, bumps the version by one and stamps the writer,
    /// all only if `guard` holds. Returns the new version, or `None` when the
    /// guard failed and nothing was written.
    pub fn apply_update_if(
        &self,
        table: SyncTable,
        record_id: &str,
        columns: &[(&'static str, SqlValue)],
        guard: VersionGuard,
        stamp: SyncStamp<'_>,
    ) -> ScheduleResult<Option<i64>> {
        let mut sets: Vec<String> = Vec::with_capacity(columns.len() + 5);
        let mut values: Vec<SqlValue> = Vec::with_capacity(columns.len() + 6);
        for (name, value) in columns {
            sets.push(format!("{} = ?", name));
            values.push(value.clone());
        }
        sets.push("version = version + 1".to_string());
        sets.push("is_deleted = 0".to_string());
        sets.push("updated_at = ?".to_string());
        sets.push("synced_at = ?".to_string());
        sets.push("last_device_id = ?".to_string());
        values.push(SqlValue::Integer(stamp.timestamp));
        values.push(SqlValue::Integer(stamp.synced_at));
        values.push(SqlValue::Text(stamp.device_id.to_string()));

        let (guard_sql, guard_version) = guard.clause();
        values.push(SqlValue::Text(record_id.to_string()));
        values.push(SqlValue::Integer(guard_version));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ? AND {} RETURNING version",
            table.as_str(),
            sets.join(", "),
            table.key_column(),
            guard_sql
        );
        self.conditional_update(&sql, params_from_iter(values.iter()))
    }

    /// Server-side conditional tombstone. The stored version must equal
    /// `expected_version` and the row must still be live.
    pub fn tombstone_if(
        &self,
        table: SyncTable,
        record_id: &str,
        expected_version: i64,
        stamp: SyncStamp<'_>,
    ) -> ScheduleResult<Option<i64>> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, version = version + 1, updated_at = ?,
                 synced_at = ?, last_device_id = ?
             WHERE {} = ? AND version = ? AND is_deleted = 0
             RETURNING version",
            table.as_str(),
            table.key_column()
        );
        self.conditional_update(
            &sql,
            params![
                stamp.timestamp,
                stamp.synced_at,
                stamp.device_id,
                record_id,
                expected_version
            ],
        )
    }

    /// Client-side: overwrite a row with the server's authoritative state.
    ///
    /// With `skip_if_dirty`, a row holding unsynced local edits is left
    /// alone. Returns whether anything was written.
    pub fn adopt_server_row(
        &self,
        table: SyncTable,
        record_id: &str,
        columns: &[(&'static str, SqlValue)],
        version: i64,
        is_deleted: bool,
        updated_at: i64,
        skip_if_dirty: bool,
    ) -> ScheduleResult<bool> {
        let exists = self.read_entity(table, record_id)?;
        let Some(existing) = exists else {
            if is_deleted || columns.is_empty() {
                return Ok(false);
            }
            self.insert_synced_entity(table, record_id, columns, version, false, updated_at, None)?;
            return Ok(true);
        };
        if skip_if_dirty && existing.is_dirty {
            return Ok(false);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        for (name, value) in columns {
            sets.push(format!("{} = ?", name));
            values.push(value.clone());
        }
        sets.push("version = ?".to_string());
        sets.push("is_deleted = ?".to_string());
        sets.push("is_dirty = 0".to_string());
        sets.push("updated_at = ?".to_string());
        values.push(SqlValue::Integer(version));
        values.push(SqlValue::Integer(is_deleted as i64));
        values.push(SqlValue::Integer(updated_at));
        if table.is_cacheable() {
            sets.push("cached_at = ?".to_string());
            values.push(SqlValue::Integer(now_ms()));
        }
        values.push(SqlValue::Text(record_id.to_string()));

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            table.as_str(),
            sets.join(", "),
            table.key_column()
        );
        if skip_if_dirty {
            sql.push_str(" AND is_dirty = 0");
        }
        let changed = self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(changed > 0)
    }

    /// Client-side: record the server's acknowledgement of a pushed row.
    ///
    /// Adopts `new_version`. Clears the dirty flag only if the row's local
    /// revision is still `pushed_rev`; an edit made while the push was in
    /// flight keeps the row dirty. Returns whether the row is now clean.
    pub fn acknowledge_push(
        &self,
        table: SyncTable,
        record_id: &str,
        new_version: i64,
        pushed_rev: i64,
    ) -> ScheduleResult<bool> {
        let sql = format!(
            "UPDATE {} SET version = ?,
                 is_dirty = CASE WHEN local_rev = ? THEN 0 ELSE is_dirty END
             WHERE {} = ?
             RETURNING is_dirty",
            table.as_str(),
            table.key_column()
        );
        let still_dirty = self.conditional_update(&sql, params![new_version, pushed_rev, record_id])?;
        Ok(still_dirty == Some(0))
    }

    /// Client-side: adopt a new base version without touching data or flags
    pub fn set_base_version(&self, table: SyncTable, record_id: &str, version: i64) -> ScheduleResult<()> {
        let sql = format!(
            "UPDATE {} SET version = ? WHERE {} = ?",
            table.as_str(),
            table.key_column()
        );
        self.conn.execute(&sql, params![version, record_id])?;
        Ok(())
    }

    /// Mark a row as locally modified: dirty, next local revision.
    /// Returns false when the row does not exist.
    pub fn touch_dirty(&self, table: SyncTable, record_id: &str) -> ScheduleResult<bool> {
        let sql = format!(
            "UPDATE {} SET is_dirty = 1, local_rev = local_rev + 1, updated_at = ? WHERE {} = ?",
            table.as_str(),
            table.key_column()
        );
        Ok(self.conn.execute(&sql, params![now_ms(), record_id])? > 0)
    }

    /// Tombstone a row locally and mark it dirty
    pub fn delete_entity(&self, table: SyncTable, record_id: &str) -> ScheduleResult<bool> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, is_dirty = 1, local_rev = local_rev + 1, updated_at = ?
             WHERE {} = ? AND is_deleted = 0",
            table.as_str(),
            table.key_column()
        );
        let changed = self.conn.execute(&sql, params![now_ms(), record_id])?;
        tracing::debug!(table = %table, record_id, changed, "Tombstoned entity");
        Ok(changed > 0)
    }

    // ========================================================================
    // Records
    // ========================================================================

    fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
        Ok(Record {
            id: row.get(0)?,
            record_number: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            version: row.get(4)?,
            is_dirty: row.get(5)?,
            is_deleted: row.get(6)?,
        })
    }

    const RECORD_SELECT: &'static str =
        "SELECT id, record_number, name, phone, version, is_dirty, is_deleted FROM records";

    pub fn get_record(&self, record_id: &str) -> ScheduleResult<Option<Record>> {
        let sql = format!("{} WHERE id = ?", Self::RECORD_SELECT);
        Ok(self
            .conn
            .query_row(&sql, params![record_id], Self::row_to_record)
            .optional()?)
    }

    /// Find a live record by number. When a name is given, a record with a
    /// different non-empty name does not match.
    pub fn find_record(&self, record_number: &str, name: Option<&str>) -> ScheduleResult<Option<Record>> {
        let sql = format!(
            "{} WHERE record_number = ?1 AND is_deleted = 0
                 AND (?2 IS NULL OR name IS NULL OR name = '' OR name = ?2)
             ORDER BY (name = ?2) DESC, created_at ASC
             LIMIT 1",
            Self::RECORD_SELECT
        );
        Ok(self
            .conn
            .query_row(&sql, params![record_number.trim(), name], Self::row_to_record)
            .optional()?)
    }

    /// Look up a record by number, creating it on first reference.
    pub fn ensure_record(
        &self,
        record_number: &str,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> ScheduleResult<Record> {
        validate_record_number(record_number)?;
        let record_number = record_number.trim();

        if let Some(existing) = self.find_record(record_number, name)? {
            let fill_name = existing.name.as_deref().map_or(true, str::is_empty) && name.is_some();
            let fill_phone = existing.phone.is_none() && phone.is_some();
            if fill_name || fill_phone {
                self.conn.execute(
                    "UPDATE records SET name = COALESCE(NULLIF(name, ''), ?), phone = COALESCE(phone, ?)
                     WHERE id = ?",
                    params![name, phone, existing.id],
                )?;
                self.touch_dirty(SyncTable::Records, &existing.id)?;
                return self
                    .get_record(&existing.id)?
                    .ok_or_else(|| ScheduleError::not_found(format!("record {}", existing.id)));
            }
            return Ok(existing);
        }

        let record = Record::new(
            record_number.to_string(),
            name.map(str::to_string),
            phone.map(str::to_string),
        );
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO records (id, record_number, name, phone, version, is_dirty, local_rev,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, 1, 1, ?, ?)",
            params![record.id, record.record_number, record.name, record.phone, now, now],
        )?;
        tracing::debug!(record_id = %record.id, "Created record");
        Ok(record)
    }

    /// Whether a record exists and is not tombstoned
    pub fn record_is_live(&self, record_id: &str) -> ScheduleResult<bool> {
        Ok(self
            .get_record(record_id)?
            .map(|r| !r.is_deleted)
            .unwrap_or(false))
    }

    /// Server-side: insert a placeholder record so a child row has a parent.
    /// The stub carries version 0 and no sync time, so it is never sent on
    /// pull and the real record overwrites it when pushed.
    pub fn ensure_record_stub(&self, record_id: &str) -> ScheduleResult<bool> {
        let now = now_ms();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO records (id, record_number, version, created_at, updated_at)
             VALUES (?, '', 0, ?, ?)",
            params![record_id, now, now],
        )?;
        if inserted > 0 {
            tracing::debug!(record_id, "Inserted stub record");
        }
        Ok(inserted > 0)
    }

    // ========================================================================
    // Books
    // ========================================================================

    fn row_to_book(row: &Row) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            name: row.get(1)?,
            archived_at: row.get(2)?,
            version: row.get(3)?,
            is_dirty: row.get(4)?,
            is_deleted: row.get(5)?,
        })
    }

    pub fn create_book(&self, name: &str) -> ScheduleResult<Book> {
        validate_book_name(name)?;
        let book = Book::new(name.trim().to_string());
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO books (id, name, version, is_dirty, local_rev, created_at, updated_at)
             VALUES (?, ?, 0, 1, 1, ?, ?)",
            params![book.id, book.name, now, now],
        )?;
        Ok(book)
    }

    pub fn get_book(&self, book_id: &str) -> ScheduleResult<Option<Book>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, archived_at, version, is_dirty, is_deleted FROM books WHERE id = ?",
                params![book_id],
                Self::row_to_book,
            )
            .optional()?)
    }

    /// Server-side: placeholder book owned by the device that referenced it
    pub fn ensure_book_stub(&self, book_id: &str, owner_device_id: &str) -> ScheduleResult<bool> {
        let now = now_ms();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO books (id, name, owner_device_id, version, created_at, updated_at)
             VALUES (?, '', ?, 0, ?, ?)",
            params![book_id, owner_device_id, now, now],
        )?;
        if inserted > 0 {
            tracing::debug!(book_id, "Inserted stub book");
        }
        Ok(inserted > 0)
    }

    /// Server-side: the first device to push a book owns it
    pub fn claim_book_owner(&self, book_id: &str, device_id: &str) -> ScheduleResult<()> {
        self.conn.execute(
            "UPDATE books SET owner_device_id = ? WHERE id = ? AND owner_device_id IS NULL",
            params![device_id, book_id],
        )?;
        Ok(())
    }

    /// Administrative: let another device write into a book
    pub fn grant_book_access(&self, book_id: &str, device_id: &str) -> ScheduleResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO book_access (book_id, device_id, granted_at) VALUES (?, ?, ?)",
            params![book_id, device_id, now_ms()],
        )?;
        Ok(())
    }

    /// Whether a device may write into a book: the book is live and the
    /// device owns it or was granted access.
    pub fn device_can_write_book(&self, book_id: &str, device_id: &str) -> ScheduleResult<bool> {
        let allowed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM books b
             WHERE b.id = ?1 AND b.is_deleted = 0
               AND (b.owner_device_id = ?2
                    OR EXISTS (SELECT 1 FROM book_access a
                               WHERE a.book_id = b.id AND a.device_id = ?2))",
            params![book_id, device_id],
            |row| row.get(0),
        )?;
        Ok(allowed > 0)
    }

    /// Whether a live event places the record in a book the device may write
    pub fn device_can_write_record(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool> {
        let allowed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events e
             JOIN books b ON b.id = e.book_id AND b.is_deleted = 0
             WHERE e.record_id = ?1 AND e.is_deleted = 0
               AND (b.owner_device_id = ?2
                    OR EXISTS (SELECT 1 FROM book_access a
                               WHERE a.book_id = b.id AND a.device_id = ?2))",
            params![record_id, device_id],
            |row| row.get(0),
        )?;
        Ok(allowed > 0)
    }

    // ========================================================================
    // Events
    // ========================================================================

    const EVENT_SELECT: &'static str =
        "SELECT id, book_id, record_id, title, start_at, end_at, event_types, is_removed,
                removal_reason, original_event_id, new_event_id, version, is_dirty, is_deleted
         FROM events";

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let types_json: String = row.get(6)?;
        Ok(Event {
            id: row.get(0)?,
            book_id: row.get(1)?,
            record_id: row.get(2)?,
            title: row.get(3)?,
            start_at: row.get(4)?,
            end_at: row.get(5)?,
            event_types: serde_json::from_str(&types_json).unwrap_or_default(),
            is_removed: row.get(7)?,
            removal_reason: row.get(8)?,
            original_event_id: row.get(9)?,
            new_event_id: row.get(10)?,
            version: row.get(11)?,
            is_dirty: row.get(12)?,
            is_deleted: row.get(13)?,
        })
    }

    /// Insert a new local event. The book and record must exist.
    pub fn create_event(&self, event: Event) -> ScheduleResult<Event> {
        validate_time_range(event.start_at, event.end_at)?;
        validate_event_types(&event.event_types)?;
        if self.get_book(&event.book_id)?.is_none() {
            return Err(ScheduleError::not_found(format!("book {}", event.book_id)));
        }
        if !self.record_is_live(&event.record_id)? {
            return Err(ScheduleError::not_found(format!("record {}", event.record_id)));
        }

        let now = now_ms();
        self.conn.execute(
            "INSERT INTO events (id, book_id, record_id, title, start_at, end_at, event_types,
                                 is_removed, removal_reason, original_event_id, new_event_id,
                                 version, is_dirty, local_rev, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1, 1, ?, ?)",
            params![
                event.id,
                event.book_id,
                event.record_id,
                event.title,
                event.start_at,
                event.end_at,
                serde_json::to_string(&event.event_types)?,
                event.is_removed,
                event.removal_reason,
                event.original_event_id,
                event.new_event_id,
                now,
                now,
            ],
        )?;
        tracing::debug!(event_id = %event.id, record_id = %event.record_id, "Created event");
        Ok(Event {
            version: 0,
            is_dirty: true,
            is_deleted: false,
            ..event
        })
    }

    pub fn get_event(&self, event_id: &str) -> ScheduleResult<Option<Event>> {
        let sql = format!("{} WHERE id = ?", Self::EVENT_SELECT);
        Ok(self
            .conn
            .query_row(&sql, params![event_id], Self::row_to_event)
            .optional()?)
    }

    /// Live events for a record, oldest first
    pub fn get_events_for_record(&self, record_id: &str) -> ScheduleResult<Vec<Event>> {
        let sql = format!(
            "{} WHERE record_id = ? AND is_deleted = 0 ORDER BY start_at ASC",
            Self::EVENT_SELECT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![record_id], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Soft-remove an event. A blank reason is rejected without mutation.
    pub fn remove_event(&self, event_id: &str, reason: &str) -> ScheduleResult<Event> {
        validate_removal_reason(reason)?;
        let changed = self.conn.execute(
            "UPDATE events SET is_removed = 1, removal_reason = ?,
                 is_dirty = 1, local_rev = local_rev + 1, updated_at = ?
             WHERE id = ? AND is_deleted = 0 AND is_removed = 0",
            params![reason.trim(), now_ms(), event_id],
        )?;
        let event = self
            .get_event(event_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("event {}", event_id)))?;
        if changed == 0 {
            return Err(ScheduleError::validation("event_id", "event is already removed or deleted"));
        }
        Ok(event)
    }

    /// Move an event to a new time.
    ///
    /// The original is soft-removed with reason "time changed" and a new
    /// event is created; the two are linked both ways. Notes and drawings
    /// are keyed elsewhere and stay untouched. Atomic.
    pub fn change_event_time(
        &self,
        event_id: &str,
        start_at: i64,
        end_at: Option<i64>,
    ) -> ScheduleResult<Event> {
        validate_time_range(start_at, end_at)?;
        self.transaction(|db| {
            let original = db
                .get_event(event_id)?
                .filter(|e| !e.is_deleted)
                .ok_or_else(|| ScheduleError::not_found(format!("event {}", event_id)))?;
            if original.is_removed {
                return Err(ScheduleError::validation("event_id", "event is already removed"));
            }

            let mut replacement = Event::new(
                original.book_id.clone(),
                original.record_id.clone(),
                start_at,
                end_at,
            );
            replacement.title = original.title.clone();
            replacement.event_types = original.event_types.clone();
            replacement.original_event_id = Some(original.id.clone());
            let replacement = db.create_event(replacement)?;

            db.conn.execute(
                "UPDATE events SET is_removed = 1, removal_reason = ?, new_event_id = ?,
                     is_dirty = 1, local_rev = local_rev + 1, updated_at = ?
                 WHERE id = ?",
                params![TIME_CHANGED_REASON, replacement.id, now_ms(), original.id],
            )?;
            tracing::debug!(from = %original.id, to = %replacement.id, "Changed event time");
            Ok(replacement)
        })
    }

    // ========================================================================
    // Notes
    // ========================================================================

    const NOTE_SELECT: &'static str =
        "SELECT record_id, pages, version, is_dirty, is_deleted, locked_by_device_id, locked_at
         FROM notes";

    fn row_to_note(row: &Row) -> rusqlite::Result<Note> {
        let pages: String = row.get(1)?;
        Ok(Note {
            record_id: row.get(0)?,
            pages: serde_json::from_str(&pages).unwrap_or_else(|_| serde_json::json!([])),
            version: row.get(2)?,
            is_dirty: row.get(3)?,
            is_deleted: row.get(4)?,
            locked_by_device_id: row.get(5)?,
            locked_at: row.get(6)?,
        })
    }

    pub fn get_note(&self, record_id: &str) -> ScheduleResult<Option<Note>> {
        let sql = format!("{} WHERE record_id = ?", Self::NOTE_SELECT);
        Ok(self
            .conn
            .query_row(&sql, params![record_id], Self::row_to_note)
            .optional()?)
    }

    /// Create an empty clean note (version 0) if the record has none.
    /// Returns whether a row was inserted.
    pub fn ensure_note_row(&self, record_id: &str) -> ScheduleResult<bool> {
        let now = now_ms();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO notes (record_id, pages, version, created_at, updated_at, cached_at)
             VALUES (?, '[]', 0, ?, ?, ?)",
            params![record_id, now, now, now],
        )?;
        Ok(inserted > 0)
    }

    /// Write a record's note pages locally (creates the note on first save)
    pub fn save_note(&self, record_id: &str, pages: &serde_json::Value) -> ScheduleResult<Note> {
        if !self.record_is_live(record_id)? {
            return Err(ScheduleError::not_found(format!("record {}", record_id)));
        }
        let pages_json = serde_json::to_string(pages)?;
        validate_payload_size(&pages_json, "pages")?;

        let now = now_ms();
        self.conn.execute(
            "INSERT INTO notes (record_id, pages, version, is_dirty, local_rev, created_at,
                                updated_at, cached_at)
             VALUES (?1, ?2, 0, 1, 1, ?3, ?3, ?3)
             ON CONFLICT(record_id) DO UPDATE SET
                 pages = excluded.pages,
                 is_deleted = 0,
                 is_dirty = 1,
                 local_rev = local_rev + 1,
                 updated_at = excluded.updated_at,
                 cached_at = excluded.cached_at",
            params![record_id, pages_json, now],
        )?;
        self.get_note(record_id)?
            .ok_or_else(|| ScheduleError::database_op(format!("note {} missing after save", record_id)))
    }

    // ========================================================================
    // Schedule drawings
    // ========================================================================

    const DRAWING_SELECT: &'static str =
        "SELECT book_id, date, view_mode, strokes, version, is_dirty, is_deleted
         FROM schedule_drawings";

    fn row_to_drawing(row: &Row) -> rusqlite::Result<ScheduleDrawing> {
        let view_mode: String = row.get(2)?;
        let strokes: String = row.get(3)?;
        Ok(ScheduleDrawing {
            book_id: row.get(0)?,
            date: row.get(1)?,
            view_mode: ViewMode::parse(&view_mode).unwrap_or(ViewMode::Day),
            strokes: serde_json::from_str(&strokes).unwrap_or_else(|_| serde_json::json!([])),
            version: row.get(4)?,
            is_dirty: row.get(5)?,
            is_deleted: row.get(6)?,
        })
    }

    pub fn get_drawing(
        &self,
        book_id: &str,
        date: &str,
        view_mode: ViewMode,
    ) -> ScheduleResult<Option<ScheduleDrawing>> {
        let key = drawing_key(book_id, date, view_mode);
        let sql = format!("{} WHERE drawing_key = ?", Self::DRAWING_SELECT);
        Ok(self
            .conn
            .query_row(&sql, params![key], Self::row_to_drawing)
            .optional()?)
    }

    /// Write the strokes of a (book, date, view) canvas locally
    pub fn save_drawing(
        &self,
        book_id: &str,
        date: &str,
        view_mode: ViewMode,
        strokes: &serde_json::Value,
    ) -> ScheduleResult<ScheduleDrawing> {
        let date = validate_date(date, "date")?;
        if self.get_book(book_id)?.filter(|b| !b.is_deleted).is_none() {
            return Err(ScheduleError::not_found(format!("book {}", book_id)));
        }
        let strokes_json = serde_json::to_string(strokes)?;
        validate_payload_size(&strokes_json, "strokes")?;

        let key = drawing_key(book_id, &date, view_mode);
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO schedule_drawings (drawing_key, book_id, date, view_mode, strokes, version,
                                            is_dirty, local_rev, created_at, updated_at, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, 1, ?6, ?6, ?6)
             ON CONFLICT(drawing_key) DO UPDATE SET
                 strokes = excluded.strokes,
                 is_deleted = 0,
                 is_dirty = 1,
                 local_rev = local_rev + 1,
                 updated_at = excluded.updated_at,
                 cached_at = excluded.cached_at",
            params![key, book_id, date, view_mode.as_str(), strokes_json, now],
        )?;
        self.get_drawing(book_id, &date, view_mode)?
            .ok_or_else(|| ScheduleError::database_op(format!("drawing {} missing after save", key)))
    }

    // ========================================================================
    // Client sync state
    // ========================================================================

    pub fn get_sync_state(&self) -> ScheduleResult<SyncState> {
        Ok(self.conn.query_row(
            "SELECT server_url, last_sync_at, last_push_at FROM sync_state WHERE id = 1",
            [],
            |row| {
                Ok(SyncState {
                    server_url: row.get(0)?,
                    last_sync_at: row.get(1)?,
                    last_push_at: row.get(2)?,
                })
            },
        )?)
    }

    pub fn set_server_url(&self, url: Option<&str>) -> ScheduleResult<()> {
        self.conn
            .execute("UPDATE sync_state SET server_url = ? WHERE id = 1", params![url])?;
        Ok(())
    }

    pub fn set_last_sync_at(&self, cursor: i64) -> ScheduleResult<()> {
        self.conn
            .execute("UPDATE sync_state SET last_sync_at = ? WHERE id = 1", params![cursor])?;
        Ok(())
    }

    pub fn set_last_push_at(&self, at: i64) -> ScheduleResult<()> {
        self.conn
            .execute("UPDATE sync_state SET last_push_at = ? WHERE id = 1", params![at])?;
        Ok(())
    }

    // ========================================================================
    // Devices (server)
    // ========================================================================

    /// Administrative: register a device and its token
    pub fn register_device(
        &self,
        device_id: &str,
        device_name: Option<&str>,
        token: &str,
    ) -> ScheduleResult<()> {
        self.conn.execute(
            "INSERT INTO devices (device_id, device_name, token_hash, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                 device_name = excluded.device_name,
                 token_hash = excluded.token_hash,
                 revoked_at = NULL",
            params![device_id, device_name, hash_token(token), now_ms()],
        )?;
        Ok(())
    }

    pub fn revoke_device(&self, device_id: &str) -> ScheduleResult<bool> {
        let changed = self.conn.execute(
            "UPDATE devices SET revoked_at = ? WHERE device_id = ? AND revoked_at IS NULL",
            params![now_ms(), device_id],
        )?;
        Ok(changed > 0)
    }

    /// Check a device's credentials against its stored token hash
    pub fn verify_device(&self, device_id: &str, token: &str) -> ScheduleResult<bool> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT token_hash FROM devices WHERE device_id = ? AND revoked_at IS NULL",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.map_or(false, |hash| hash == hash_token(token)))
    }

    // ========================================================================
    // Sync audit log (server)
    // ========================================================================

    pub fn log_sync(
        &self,
        device_id: &str,
        operation: &str,
        table_name: &str,
        record_id: Option<&str>,
        status: SyncLogStatus,
        error: Option<&str>,
    ) -> ScheduleResult<()> {
        self.conn.execute(
            "INSERT INTO sync_log (device_id, operation, table_name, record_id, status, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![device_id, operation, table_name, record_id, status.as_str(), error, now_ms()],
        )?;
        Ok(())
    }

    /// Most recent audit entries first
    pub fn get_sync_log(&self, limit: i64) -> ScheduleResult<Vec<SyncLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, operation, table_name, record_id, status, error, created_at
             FROM sync_log ORDER BY id DESC LIMIT ?",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(SyncLogEntry {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    operation: row.get(2)?,
                    table_name: row.get(3)?,
                    record_id: row.get(4)?,
                    status: row.get(5)?,
                    error: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::new_id;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (Database, Book, Record) {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let record = db.ensure_record("R-1", Some("Ada"), None).unwrap();
        (db, book, record)
    }

    #[test]
    fn test_create_database_file() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("schedule.db")).unwrap();
        let state = db.get_sync_state().unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn test_ensure_record_reuses_existing() {
        let db = Database::new_in_memory().unwrap();
        let first = db.ensure_record("R-7", None, None).unwrap();
        let second = db.ensure_record(" R-7 ", Some("Grace"), None).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name.as_deref(), Some("Grace"));

        let other = db.ensure_record("R-7", Some("Someone Else"), None).unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn test_local_writes_are_dirty_with_base_version() {
        let (db, book, record) = setup();
        assert!(book.is_dirty);
        let row = db.read_entity(SyncTable::Records, &record.id).unwrap().unwrap();
        assert!(row.is_dirty);
        assert_eq!(row.version, 0);
        assert_eq!(row.local_rev, 1);
        assert_eq!(row.data["record_number"], json!("R-1"));
    }

    #[test]
    fn test_remove_event_requires_reason() {
        let (db, book, record) = setup();
        let event = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1_000, None))
            .unwrap();

        let err = db.remove_event(&event.id, "  ").unwrap_err();
        assert!(matches!(err, ScheduleError::Validation { .. }));
        assert!(!db.get_event(&event.id).unwrap().unwrap().is_removed);

        let removed = db.remove_event(&event.id, "cancelled by phone").unwrap();
        assert!(removed.is_removed);
        assert_eq!(removed.removal_reason.as_deref(), Some("cancelled by phone"));
    }

    #[test]
    fn test_change_event_time_links_both_ways() {
        let (db, book, record) = setup();
        db.save_note(&record.id, &json!([[{"x": 1}]])).unwrap();
        let mut event = Event::new(book.id.clone(), record.id.clone(), 1_000, Some(2_000));
        event.event_types = vec!["checkup".to_string()];
        let event = db.create_event(event).unwrap();

        let moved = db.change_event_time(&event.id, 5_000, Some(6_000)).unwrap();
        let original = db.get_event(&event.id).unwrap().unwrap();

        assert!(original.is_removed);
        assert_eq!(original.removal_reason.as_deref(), Some(TIME_CHANGED_REASON));
        assert_eq!(original.new_event_id.as_deref(), Some(moved.id.as_str()));
        assert_eq!(moved.original_event_id.as_deref(), Some(event.id.as_str()));
        assert_eq!(moved.event_types, vec!["checkup".to_string()]);
        assert_eq!(moved.start_at, 5_000);

        // The record's note is untouched
        let note = db.get_note(&record.id).unwrap().unwrap();
        assert_eq!(note.pages, json!([[{"x": 1}]]));
    }

    #[test]
    fn test_change_event_time_rolls_back_on_bad_range() {
        let (db, book, record) = setup();
        let event = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1_000, None))
            .unwrap();
        assert!(db.change_event_time(&event.id, 5_000, Some(4_000)).is_err());
        assert!(!db.get_event(&event.id).unwrap().unwrap().is_removed);
        assert_eq!(db.get_events_for_record(&record.id).unwrap().len(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (db, _book, record) = setup();
        let result: ScheduleResult<()> = db.transaction(|db| {
            db.save_note(&record.id, &json!([["stroke"]]))?;
            Err(ScheduleError::Other("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_note(&record.id).unwrap().is_none());
    }

    #[test]
    fn test_save_note_increments_local_rev() {
        let (db, _book, record) = setup();
        db.save_note(&record.id, &json!([])).unwrap();
        db.save_note(&record.id, &json!([["a"]])).unwrap();
        let row = db.read_entity(SyncTable::Notes, &record.id).unwrap().unwrap();
        assert_eq!(row.local_rev, 2);
        assert!(row.is_dirty);
    }

    #[test]
    fn test_save_drawing_keyed_by_slot() {
        let (db, book, _record) = setup();
        db.save_drawing(&book.id, "2025-04-01", ViewMode::Day, &json!([1])).unwrap();
        db.save_drawing(&book.id, "2025-04-01", ViewMode::Day, &json!([2])).unwrap();
        db.save_drawing(&book.id, "2025-04-01", ViewMode::Week, &json!([3])).unwrap();

        let day = db.get_drawing(&book.id, "2025-04-01", ViewMode::Day).unwrap().unwrap();
        assert_eq!(day.strokes, json!([2]));
        let key = drawing_key(&book.id, "2025-04-01", ViewMode::Week);
        assert!(db.read_entity(SyncTable::ScheduleDrawings, &key).unwrap().is_some());
    }

    #[test]
    fn test_acknowledge_push_keeps_dirty_after_concurrent_edit() {
        let (db, _book, record) = setup();
        let row = db.read_entity(SyncTable::Records, &record.id).unwrap().unwrap();

        // Edited again while the push was in flight
        db.touch_dirty(SyncTable::Records, &record.id).unwrap();
        let clean = db
            .acknowledge_push(SyncTable::Records, &record.id, 1, row.local_rev)
            .unwrap();
        assert!(!clean);
        let after = db.read_entity(SyncTable::Records, &record.id).unwrap().unwrap();
        assert!(after.is_dirty);
        assert_eq!(after.version, 1);

        let clean = db
            .acknowledge_push(SyncTable::Records, &record.id, 2, after.local_rev)
            .unwrap();
        assert!(clean);
    }

    #[test]
    fn test_apply_update_guard() {
        let db = Database::new_in_memory().unwrap();
        let id = new_id();
        let cols = vec![
            ("record_number", SqlValue::Text("R-1".into())),
            ("name", SqlValue::Null),
            ("phone", SqlValue::Null),
        ];
        let stamp = SyncStamp { device_id: "dev", timestamp: 10, synced_at: 20 };
        db.insert_synced_entity(SyncTable::Records, &id, &cols, 3, false, 10, Some(stamp)).unwrap();

        let behind = db
            .apply_update_if(SyncTable::Records, &id, &cols, VersionGuard::AtMost(2), stamp)
            .unwrap();
        assert_eq!(behind, None);

        let applied = db
            .apply_update_if(SyncTable::Records, &id, &cols, VersionGuard::AtMost(3), stamp)
            .unwrap();
        assert_eq!(applied, Some(4));
    }

    #[test]
    fn test_tombstone_requires_exact_version() {
        let db = Database::new_in_memory().unwrap();
        let id = new_id();
        let cols = vec![("name", SqlValue::Text("Book".into())), ("archived_at", SqlValue::Null)];
        let stamp = SyncStamp { device_id: "dev", timestamp: 1, synced_at: 2 };
        db.insert_synced_entity(SyncTable::Books, &id, &cols, 2, false, 1, Some(stamp)).unwrap();

        assert_eq!(db.tombstone_if(SyncTable::Books, &id, 1, stamp).unwrap(), None);
        assert_eq!(db.tombstone_if(SyncTable::Books, &id, 2, stamp).unwrap(), Some(3));
        // Already tombstoned
        assert_eq!(db.tombstone_if(SyncTable::Books, &id, 3, stamp).unwrap(), None);
        assert!(db.read_entity(SyncTable::Books, &id).unwrap().unwrap().is_deleted);
    }

    #[test]
    fn test_adopt_server_row_skips_dirty() {
        let (db, _book, record) = setup();
        let cols = vec![
            ("record_number", SqlValue::Text("R-1".into())),
            ("name", SqlValue::Text("Server Name".into())),
            ("phone", SqlValue::Null),
        ];
        let written = db
            .adopt_server_row(SyncTable::Records, &record.id, &cols, 5, false, 1, true)
            .unwrap();
        assert!(!written);
        assert_eq!(db.get_record(&record.id).unwrap().unwrap().name.as_deref(), Some("Ada"));

        let written = db
            .adopt_server_row(SyncTable::Records, &record.id, &cols, 5, false, 1, false)
            .unwrap();
        assert!(written);
        let record = db.get_record(&record.id).unwrap().unwrap();
        assert_eq!(record.name.as_deref(), Some("Server Name"));
        assert_eq!(record.version, 5);
        assert!(!record.is_dirty);
    }

    #[test]
    fn test_changed_since_excludes_own_writes() {
        let db = Database::new_in_memory().unwrap();
        let mine = new_id();
        let theirs = new_id();
        let cols = vec![("name", SqlValue::Text("B".into())), ("archived_at", SqlValue::Null)];
        let a = SyncStamp { device_id: "a", timestamp: 1, synced_at: 10 };
        let b = SyncStamp { device_id: "b", timestamp: 1, synced_at: 11 };
        db.insert_synced_entity(SyncTable::Books, &mine, &cols, 1, false, 1, Some(a)).unwrap();
        db.insert_synced_entity(SyncTable::Books, &theirs, &cols, 1, false, 1, Some(b)).unwrap();

        let rows = db.changed_since(SyncTable::Books, 0, "a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record_id, theirs);
        assert!(db.changed_since(SyncTable::Books, 11, "a").unwrap().is_empty());
        assert_eq!(db.max_synced_at().unwrap(), 11);
    }

    #[test]
    fn test_device_verification() {
        let db = Database::new_in_memory().unwrap();
        let device = new_id();
        db.register_device(&device, Some("tablet"), "s3cret").unwrap();

        assert!(db.verify_device(&device, "s3cret").unwrap());
        assert!(!db.verify_device(&device, "wrong").unwrap());
        assert!(!db.verify_device(&new_id(), "s3cret").unwrap());

        db.revoke_device(&device).unwrap();
        assert!(!db.verify_device(&device, "s3cret").unwrap());
    }

    #[test]
    fn test_book_access() {
        let db = Database::new_in_memory().unwrap();
        let book = new_id();
        db.ensure_book_stub(&book, "owner").unwrap();

        assert!(db.device_can_write_book(&book, "owner").unwrap());
        assert!(!db.device_can_write_book(&book, "guest").unwrap());
        db.grant_book_access(&book, "guest").unwrap();
        assert!(db.device_can_write_book(&book, "guest").unwrap());
    }

    #[test]
    fn test_sync_log_records_status() {
        let db = Database::new_in_memory().unwrap();
        db.log_sync("dev", "push", "notes", Some("abc"), SyncLogStatus::Conflict, None)
            .unwrap();
        let log = db.get_sync_log(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "conflict");
    }
}
