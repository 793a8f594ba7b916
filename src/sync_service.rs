//! Authoritative sync service.
//!
//! This is the apply path every device pushes into and pulls from:
//! - push: verify credentials, whitelist and normalize the whole changeset,
//!   then apply each change under optimistic version checking
//! - pull: changes other devices made since the caller's cursor
//! - resolve: apply a user's conflict decision against the current version
//! - batch: all-or-nothing note and drawing writes
//! - note locks
//!
//! The HTTP layer in `sync_server` and the in-process transport both call
//! into this type. Access to the database is serialized behind a mutex, and
//! every check-then-write is a single conditional statement.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchWriter;
use crate::database::{Database, SyncStamp, VersionGuard};
use crate::error::{ScheduleError, ScheduleResult};
use crate::locks::{LockCoordinator, NoteLocks, DEFAULT_LOCK_TIMEOUT};
use crate::models::{
    now_ms, AppliedChange, BatchSaveRequest, BatchSaveResponse, ConflictReport, EntityRow,
    FetchRequest, FetchResponse, LockRequest, PullRequest, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
    Resolution, ResolvedRecord, SyncChange, SyncLogStatus, SyncOperation, SyncTable,
};
use crate::normalize::{self, normalize_change, NormalizedChange};
use crate::validation::{validate_device_id, validate_entity_id};

/// Wire protocol version reported by the status endpoint
pub const PROTOCOL_VERSION: &str = "1.0";

/// Strictly increasing server clock (Unix ms).
///
/// Used for `synced_at` stamps and the pull cursor, so a cursor handed out
/// by a pull is always below every later write.
#[derive(Debug)]
pub struct SyncClock {
    last: AtomicI64,
}

impl SyncClock {
    /// A clock whose first tick is greater than `floor`
    pub fn starting_after(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    /// Next clock value: wall time, or one past the previous value
    pub fn tick(&self) -> i64 {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = now_ms().max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Outcome of applying one change
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// Written; the entity is now at `version`
    Applied { version: i64 },
    /// Nothing to write (already tombstoned or unknown delete);
    /// acknowledged at `version`
    Unchanged { version: i64 },
    /// Server is ahead of the caller; nothing written
    Conflict(Box<ConflictReport>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub status: String,
    pub server_time: i64,
    pub protocol_version: String,
}

fn conflict_report(change: &NormalizedChange, server: &EntityRow) -> ConflictReport {
    ConflictReport {
        table: change.table.as_str().to_string(),
        record_id: change.record_id.clone(),
        local_data: change.data.clone(),
        server_data: server.data.clone(),
        local_version: change.expected_version,
        server_version: server.version,
        local_timestamp: change.timestamp,
        server_timestamp: server.updated_at,
    }
}

fn row_to_change(row: &EntityRow) -> SyncChange {
    SyncChange {
        table: row.table.as_str().to_string(),
        record_id: row.record_id.clone(),
        operation: if row.is_deleted {
            SyncOperation::Delete
        } else {
            SyncOperation::Update
        },
        data: row.data.clone(),
        version: row.version,
        timestamp: serde_json::json!(row.updated_at),
    }
}

fn row_to_resolved(row: &EntityRow) -> ResolvedRecord {
    ResolvedRecord {
        table: row.table.as_str().to_string(),
        record_id: row.record_id.clone(),
        version: row.version,
        data: row.data.clone(),
        deleted: row.is_deleted,
    }
}

/// The authoritative sync service
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    clock: SyncClock,
    lock_timeout: Duration,
}

impl SyncService {
    pub fn new(db: Arc<Mutex<Database>>) -> ScheduleResult<Self> {
        let floor = {
            let guard = db
                .lock()
                .map_err(|_| ScheduleError::Other("database lock poisoned".into()))?;
            guard.max_synced_at()?
        };
        Ok(Self {
            db,
            clock: SyncClock::starting_after(floor),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn database(&self) -> Arc<Mutex<Database>> {
        Arc::clone(&self.db)
    }

    fn lock_db(&self) -> ScheduleResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| ScheduleError::Other("database lock poisoned".into()))
    }

    /// Administrative: register a device's credentials
    pub fn register_device(&self, device_id: &str, name: Option<&str>, token: &str) -> ScheduleResult<()> {
        let device_id = validate_device_id(device_id)?;
        self.lock_db()?.register_device(&device_id, name, token)
    }

    /// Verify credentials. Failures are audit logged.
    fn authenticate(db: &Database, device_id: &str, token: &str, operation: &str) -> ScheduleResult<String> {
        let verified = match validate_device_id(device_id) {
            Ok(id) => db.verify_device(&id, token)?.then_some(id),
            Err(_) => None,
        };
        match verified {
            Some(id) => Ok(id),
            None => {
                tracing::warn!(device_id, operation, "Rejected device credentials");
                db.log_sync(
                    device_id,
                    operation,
                    "*",
                    None,
                    SyncLogStatus::Failure,
                    Some("invalid device credentials"),
                )?;
                Err(ScheduleError::Unauthorized("invalid device credentials".into()))
            }
        }
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Apply a pushed changeset.
    ///
    /// The whole changeset is whitelisted and normalized first; one bad
    /// table, column or value rejects the push before anything is written.
    /// Changes then apply in submission order. Conflicts and per-change
    /// errors are reported without stopping the rest.
    pub fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse> {
        let mut normalized = Vec::with_capacity(request.changes.len());
        let mut rejected = None;
        for change in &request.changes {
            match normalize_change(change) {
                Ok(n) => normalized.push(n),
                Err(e) => {
                    rejected = Some((change, e));
                    break;
                }
            }
        }

        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "push")?;
        tracing::debug!(device_id = %device_id, changes = request.changes.len(), "Push received");

        if let Some((change, e)) = rejected {
            tracing::warn!(table = %change.table, record_id = %change.record_id, "Rejected push: {}", e);
            db.log_sync(
                &device_id,
                "push",
                &change.table,
                Some(&change.record_id),
                SyncLogStatus::Failure,
                Some(&e.to_string()),
            )?;
            return Err(e);
        }

        let mut response = PushResponse::default();
        for change in &normalized {
            let table = change.table.as_str();
            let result = db.transaction(|db| self.apply_normalized(db, &device_id, change));
            match result {
                Ok(ApplyResult::Applied { version }) | Ok(ApplyResult::Unchanged { version }) => {
                    tracing::trace!(table, record_id = %change.record_id, version, "Applied");
                    response.applied_count += 1;
                    response.applied.push(AppliedChange {
                        table: table.to_string(),
                        record_id: change.record_id.clone(),
                        version,
                    });
                    db.log_sync(&device_id, "push", table, Some(&change.record_id), SyncLogStatus::Success, None)?;
                }
                Ok(ApplyResult::Conflict(report)) => {
                    tracing::debug!(%report, "Conflict");
                    db.log_sync(&device_id, "push", table, Some(&change.record_id), SyncLogStatus::Conflict, None)?;
                    response.conflicts.push(*report);
                }
                Err(e) => {
                    tracing::warn!(table, record_id = %change.record_id, "Error applying change: {}", e);
                    let message = format!("Error applying {} {}: {}", table, change.record_id, e);
                    db.log_sync(
                        &device_id,
                        "push",
                        table,
                        Some(&change.record_id),
                        SyncLogStatus::Failure,
                        Some(&message),
                    )?;
                    response.errors.push(message);
                }
            }
        }

        tracing::debug!(
            applied = response.applied_count,
            conflicts = response.conflicts.len(),
            errors = response.errors.len(),
            "Push finished"
        );
        Ok(response)
    }

    /// Apply one wire change outside a push (normalizes it first)
    pub fn apply_change(&self, device_id: &str, change: &SyncChange) -> ScheduleResult<ApplyResult> {
        let normalized = normalize_change(change)?;
        let db = self.lock_db()?;
        db.transaction(|db| self.apply_normalized(db, device_id, &normalized))
    }

    fn apply_normalized(
        &self,
        db: &Database,
        device_id: &str,
        change: &NormalizedChange,
    ) -> ScheduleResult<ApplyResult> {
        let existing = db.read_entity(change.table, &change.record_id)?;

        match change.operation {
            SyncOperation::Delete => {
                let Some(row) = existing else {
                    return Ok(ApplyResult::Unchanged {
                        version: change.expected_version,
                    });
                };
                if row.is_deleted {
                    return Ok(ApplyResult::Unchanged { version: row.version });
                }
                let stamp = self.stamp(device_id, change);
                match db.tombstone_if(change.table, &change.record_id, change.expected_version, stamp)? {
                    Some(version) => Ok(ApplyResult::Applied { version }),
                    None => Ok(ApplyResult::Conflict(Box::new(conflict_report(change, &row)))),
                }
            }
            SyncOperation::Update => match existing {
                None => {
                    self.ensure_parents(db, device_id, change)?;
                    let version = change.expected_version + 1;
                    db.insert_synced_entity(
                        change.table,
                        &change.record_id,
                        &change.columns,
                        version,
                        false,
                        change.timestamp,
                        Some(self.stamp(device_id, change)),
                    )?;
                    if change.table == SyncTable::Books {
                        db.claim_book_owner(&change.record_id, device_id)?;
                    }
                    Ok(ApplyResult::Applied { version })
                }
                Some(row) => {
                    if row.version <= change.expected_version {
                        self.ensure_parents(db, device_id, change)?;
                    }
                    let stamp = self.stamp(device_id, change);
                    match db.apply_update_if(
                        change.table,
                        &change.record_id,
                        &change.columns,
                        VersionGuard::AtMost(change.expected_version),
                        stamp,
                    )? {
                        Some(version) => {
                            if change.table == SyncTable::Books {
                                db.claim_book_owner(&change.record_id, device_id)?;
                            }
                            Ok(ApplyResult::Applied { version })
                        }
                        None => Ok(ApplyResult::Conflict(Box::new(conflict_report(change, &row)))),
                    }
                }
            },
        }
    }

    fn stamp<'a>(&self, device_id: &'a str, change: &NormalizedChange) -> SyncStamp<'a> {
        SyncStamp {
            device_id,
            timestamp: change.timestamp,
            synced_at: self.clock.tick(),
        }
    }

    /// Insert placeholder parents a child row refers to
    fn ensure_parents(&self, db: &Database, device_id: &str, change: &NormalizedChange) -> ScheduleResult<()> {
        let column = |name: &str| {
            change.columns.iter().find(|(n, _)| *n == name).and_then(|(_, v)| match v {
                rusqlite::types::Value::Text(s) => Some(s.clone()),
                _ => None,
            })
        };
        match change.table {
            SyncTable::Events => {
                if let Some(record_id) = column("record_id") {
                    db.ensure_record_stub(&record_id)?;
                }
                if let Some(book_id) = column("book_id") {
                    db.ensure_book_stub(&book_id, device_id)?;
                }
            }
            SyncTable::Notes => {
                db.ensure_record_stub(&change.record_id)?;
            }
            SyncTable::ScheduleDrawings => {
                if let Some(book_id) = column("book_id") {
                    db.ensure_book_stub(&book_id, device_id)?;
                }
            }
            SyncTable::Records | SyncTable::Books => {}
        }
        Ok(())
    }

    // ========================================================================
    // Pull
    // ========================================================================

    /// Rows other devices wrote after `last_sync_at`, parents first
    pub fn get_server_changes(
        &self,
        device_id: &str,
        last_sync_at: Option<i64>,
    ) -> ScheduleResult<Vec<SyncChange>> {
        let db = self.lock_db()?;
        Self::collect_changes(&db, device_id, last_sync_at)
    }

    fn collect_changes(db: &Database, device_id: &str, last_sync_at: Option<i64>) -> ScheduleResult<Vec<SyncChange>> {
        let since = last_sync_at.unwrap_or(i64::MIN);
        let mut changes = Vec::new();
        for table in SyncTable::ALL {
            for row in db.changed_since(table, since, device_id)? {
                changes.push(row_to_change(&row));
            }
        }
        Ok(changes)
    }

    pub fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "pull")?;

        let server_time = self.clock.tick();
        let changes = Self::collect_changes(&db, &device_id, request.last_sync_at)?;
        db.log_sync(&device_id, "pull", "*", None, SyncLogStatus::Success, None)?;
        tracing::debug!(device_id = %device_id, since = ?request.last_sync_at, changes = changes.len(), "Pull served");

        Ok(PullResponse { changes, server_time })
    }

    /// One row by sync id regardless of who wrote it last.
    ///
    /// Clients use this to refill cache entries the pull cursor has already
    /// moved past. Placeholder rows nobody has written yet are not returned.
    pub fn fetch(&self, request: &FetchRequest) -> ScheduleResult<FetchResponse> {
        let table = normalize::parse_table(&request.table)?;
        let record_id = normalize::normalize_record_id(table, &request.record_id)?;

        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "fetch")?;
        let change = db
            .read_entity(table, &record_id)?
            .filter(|row| row.version > 0)
            .map(|row| row_to_change(&row));
        db.log_sync(&device_id, "fetch", table.as_str(), Some(&record_id), SyncLogStatus::Success, None)?;
        tracing::debug!(device_id = %device_id, table = %table, record_id = %record_id, found = change.is_some(), "Fetch served");

        Ok(FetchResponse { change })
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Apply a user's decision on a conflict and return the resulting row
    pub fn resolve_conflict(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "resolve")?;
        let table = normalize::parse_table(&request.table)?;
        let record_id = normalize::normalize_record_id(table, &request.record_id)?;

        let current = db
            .read_entity(table, &record_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("{} {}", table, record_id)))?;

        let data = match request.resolution {
            Resolution::UseServer => {
                db.log_sync(&device_id, "resolve", table.as_str(), Some(&record_id), SyncLogStatus::Success, None)?;
                return Ok(row_to_resolved(&current));
            }
            Resolution::UseLocal => request
                .local_data
                .as_ref()
                .ok_or_else(|| ScheduleError::validation("localData", "required for use_local"))?,
            Resolution::Merge => request
                .merged_data
                .as_ref()
                .ok_or_else(|| ScheduleError::validation("mergedData", "required for merge"))?,
        };
        let columns = normalize::normalize_data(table, &record_id, data)?;

        let stamp = SyncStamp {
            device_id: &device_id,
            timestamp: now_ms(),
            synced_at: self.clock.tick(),
        };
        let written = db.apply_update_if(table, &record_id, &columns, VersionGuard::Exactly(current.version), stamp)?;
        if written.is_none() {
            db.log_sync(&device_id, "resolve", table.as_str(), Some(&record_id), SyncLogStatus::Conflict, None)?;
            let latest = db.read_entity(table, &record_id)?.unwrap_or(current);
            return Err(ScheduleError::VersionConflict(Box::new(ConflictReport {
                table: table.as_str().to_string(),
                record_id: record_id.clone(),
                local_data: data.clone(),
                server_data: latest.data.clone(),
                local_version: latest.version,
                server_version: latest.version,
                local_timestamp: stamp.timestamp,
                server_timestamp: latest.updated_at,
            })));
        }
        db.log_sync(&device_id, "resolve", table.as_str(), Some(&record_id), SyncLogStatus::Success, None)?;
        tracing::debug!(table = %table, record_id = %record_id, resolution = request.resolution.as_str(), "Conflict resolved");

        let row = db
            .read_entity(table, &record_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("{} {}", table, record_id)))?;
        Ok(row_to_resolved(&row))
    }

    // ========================================================================
    // Batch
    // ========================================================================

    /// All-or-nothing note and drawing writes
    pub fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "batch")?;
        let writer = BatchWriter::new(&db, &device_id, self.clock.tick());
        writer.save(&request.notes, &request.drawings)
    }

    // ========================================================================
    // Locks
    // ========================================================================

    fn lock_target(request: &LockRequest) -> ScheduleResult<String> {
        validate_entity_id(&request.record_id, "recordId")
    }

    pub fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "lock")?;
        let record_id = Self::lock_target(request)?;
        NoteLocks::with_timeout(&db, self.lock_timeout).acquire(&record_id, &device_id)
    }

    pub fn release_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "unlock")?;
        let record_id = Self::lock_target(request)?;
        NoteLocks::with_timeout(&db, self.lock_timeout).release(&record_id, &device_id)
    }

    pub fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool> {
        let db = self.lock_db()?;
        let device_id = Self::authenticate(&db, &request.device_id, &request.device_token, "lock_status")?;
        let record_id = Self::lock_target(request)?;
        NoteLocks::with_timeout(&db, self.lock_timeout).is_locked_by_other(&record_id, &device_id)
    }

    /// Clear stale note locks (run periodically by the server)
    pub fn sweep_stale_locks(&self) -> ScheduleResult<usize> {
        let db = self.lock_db()?;
        NoteLocks::with_timeout(&db, self.lock_timeout).cleanup_stale_locks()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            status: "ok".to_string(),
            server_time: self.clock.tick(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}
