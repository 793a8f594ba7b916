//! Cooperative edit locks on notes.
//!
//! A device takes the lock before editing a record's note and releases it
//! when done. At most one device holds a live lock; a lock older than the
//! timeout is stale and may be taken over. Every acquisition is a single
//! conditional write, so two devices racing for the same note cannot both
//! succeed.
//!
//! Locks are not renewed while held. An edit session longer than the
//! timeout can lose its lock to another device without noticing.

use std::time::Duration;

use rusqlite::params;

use crate::database::Database;
use crate::error::ScheduleResult;
use crate::models::now_ms;

/// Default lock lifetime
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Exclusive, time-bounded edit lock per note
pub trait LockCoordinator {
    /// Take the lock. Succeeds when the note is unlocked, already held by
    /// the caller, or held by a stale lock.
    fn acquire(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool>;

    /// Drop the lock if the caller holds it. Returns whether it was held.
    fn release(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool>;

    /// Whether another device holds a live lock. Never mutates.
    fn is_locked_by_other(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool>;

    /// Clear every stale lock. Returns how many were cleared.
    fn cleanup_stale_locks(&self) -> ScheduleResult<usize>;
}

/// Note locks stored on the notes table
pub struct NoteLocks<'a> {
    db: &'a Database,
    timeout_ms: i64,
}

impl<'a> NoteLocks<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_timeout(db, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(db: &'a Database, timeout: Duration) -> Self {
        Self {
            db,
            timeout_ms: timeout.as_millis() as i64,
        }
    }

    fn stale_before(&self, now: i64) -> i64 {
        now - self.timeout_ms
    }

    /// Acquire at an explicit clock value
    pub fn acquire_at(&self, record_id: &str, device_id: &str, now: i64) -> ScheduleResult<bool> {
        if self.db.ensure_note_row(record_id)? {
            tracing::debug!(record_id, "Created empty note for lock");
        }
        let acquired = self.db.conditional_update(
            "UPDATE notes SET locked_by_device_id = ?1, locked_at = ?2
             WHERE record_id = ?3
               AND (locked_by_device_id IS NULL
                    OR locked_by_device_id = ?1
                    OR locked_at IS NULL
                    OR locked_at < ?4)
             RETURNING version",
            params![device_id, now, record_id, self.stale_before(now)],
        )?;
        tracing::debug!(record_id, device_id, acquired = acquired.is_some(), "Note lock acquire");
        Ok(acquired.is_some())
    }

    /// Lock check at an explicit clock value
    pub fn is_locked_by_other_at(&self, record_id: &str, device_id: &str, now: i64) -> ScheduleResult<bool> {
        let held: i64 = self.db.connection().query_row(
            "SELECT COUNT(*) FROM notes
             WHERE record_id = ?1
               AND locked_by_device_id IS NOT NULL
               AND locked_by_device_id != ?2
               AND locked_at IS NOT NULL
               AND locked_at >= ?3",
            params![record_id, device_id, self.stale_before(now)],
            |row| row.get(0),
        )?;
        Ok(held > 0)
    }

    /// Stale lock sweep at an explicit clock value
    pub fn cleanup_stale_locks_at(&self, now: i64) -> ScheduleResult<usize> {
        let cleared = self.db.connection().execute(
            "UPDATE notes SET locked_by_device_id = NULL, locked_at = NULL
             WHERE locked_by_device_id IS NOT NULL
               AND (locked_at IS NULL OR locked_at < ?)",
            params![self.stale_before(now)],
        )?;
        if cleared > 0 {
            tracing::debug!(cleared, "Cleared stale note locks");
        }
        Ok(cleared)
    }
}

impl LockCoordinator for NoteLocks<'_> {
    fn acquire(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool> {
        self.acquire_at(record_id, device_id, now_ms())
    }

    fn release(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool> {
        let released = self.db.conditional_update(
            "UPDATE notes SET locked_by_device_id = NULL, locked_at = NULL
             WHERE record_id = ? AND locked_by_device_id = ?
             RETURNING version",
            params![record_id, device_id],
        )?;
        Ok(released.is_some())
    }

    fn is_locked_by_other(&self, record_id: &str, device_id: &str) -> ScheduleResult<bool> {
        self.is_locked_by_other_at(record_id, device_id, now_ms())
    }

    fn cleanup_stale_locks(&self) -> ScheduleResult<usize> {
        self.cleanup_stale_locks_at(now_ms())
    }
}
