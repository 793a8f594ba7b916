//! Change tracking over the local store.
//!
//! Local mutations always succeed against the local database and are
//! visible immediately; each one marks its row dirty and advances the row's
//! local revision. The tracker turns dirty rows into the outbound changeset
//! a push sends, carrying the last observed server version as the expected
//! version.

use rusqlite::params;
use serde_json::json;

use crate::database::Database;
use crate::error::ScheduleResult;
use crate::models::{EntityRow, SyncChange, SyncOperation, SyncTable};

/// Tracks local modifications awaiting synchronization
pub trait ChangeTracker {
    /// Mark a row as locally modified. Returns false if the row is unknown.
    fn mark_dirty(&self, table: SyncTable, record_id: &str) -> ScheduleResult<bool>;

    /// All dirty rows of a table
    fn dirty_entities(&self, table: SyncTable) -> ScheduleResult<Vec<EntityRow>>;

    /// Current state of one row
    fn get_entity(&self, table: SyncTable, record_id: &str) -> ScheduleResult<Option<EntityRow>>;

    /// Dirty rows ready to push, parents first. Rows with an unresolved
    /// surfaced conflict are held back until the user decides.
    fn outbound_changes(&self) -> ScheduleResult<Vec<OutboundChange>>;
}

/// One dirty row as it will be sent, plus the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundChange {
    pub change: SyncChange,
    pub local_rev: i64,
}

/// Build the wire form of a local row
pub fn to_sync_change(row: &EntityRow) -> SyncChange {
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
        timestamp: json!(row.updated_at),
    }
}

impl ChangeTracker for Database {
    fn mark_dirty(&self, table: SyncTable, record_id: &str) -> ScheduleResult<bool> {
        self.touch_dirty(table, record_id)
    }

    fn dirty_entities(&self, table: SyncTable) -> ScheduleResult<Vec<EntityRow>> {
        self.query_entities(table, "WHERE is_dirty = 1 ORDER BY updated_at ASC", [])
    }

    fn get_entity(&self, table: SyncTable, record_id: &str) -> ScheduleResult<Option<EntityRow>> {
        self.read_entity(table, record_id)
    }

    fn outbound_changes(&self) -> ScheduleResult<Vec<OutboundChange>> {
        let mut out = Vec::new();
        for table in SyncTable::ALL {
            let clause = format!(
                "WHERE is_dirty = 1
                   AND NOT EXISTS (SELECT 1 FROM sync_conflicts c
                                   WHERE c.table_name = ?1 AND c.record_id = {}.{}
                                     AND c.resolved_at IS NULL)
                 ORDER BY updated_at ASC",
                table.as_str(),
                table.key_column()
            );
            for row in self.query_entities(table, &clause, params![table.as_str()])? {
                out.push(OutboundChange {
                    change: to_sync_change(&row),
                    local_rev: row.local_rev,
                });
            }
        }
        tracing::trace!(count = out.len(), "Collected outbound changes");
        Ok(out)
    }
}
