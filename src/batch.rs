//! All-or-nothing note and drawing writes.
//!
//! Ownership of every item is checked before anything is written. The writes
//! then run in one transaction; the first failure rolls back the whole batch.

use rusqlite::types::Value as SqlValue;

use crate::database::{Database, SyncStamp, VersionGuard};
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    drawing_key, now_ms, BatchCounts, BatchDrawingWrite, BatchNoteWrite, BatchResults,
    BatchSaveResponse, ConflictReport, SyncLogStatus, SyncTable, ViewMode,
};
use crate::normalize::{coerce_json_payload, columns_to_json};
use crate::validation::{validate_date, validate_entity_id};

/// One checked write, ready to apply
#[derive(Debug)]
struct PreparedWrite {
    table: SyncTable,
    record_id: String,
    columns: Vec<(&'static str, SqlValue)>,
    expected_version: i64,
}

/// Applies one batch on behalf of an authenticated device
pub struct BatchWriter<'a> {
    db: &'a Database,
    device_id: &'a str,
    synced_at: i64,
}

impl<'a> BatchWriter<'a> {
    /// `synced_at` is the server clock value stamped on every row of the batch
    pub fn new(db: &'a Database, device_id: &'a str, synced_at: i64) -> Self {
        Self { db, device_id, synced_at }
    }

    /// Save every note and drawing, or none of them.
    ///
    /// Item failures come back as an unsuccessful response; only audit log
    /// failures surface as errors.
    pub fn save(
        &self,
        notes: &[BatchNoteWrite],
        drawings: &[BatchDrawingWrite],
    ) -> ScheduleResult<BatchSaveResponse> {
        tracing::debug!(
            device_id = self.device_id,
            notes = notes.len(),
            drawings = drawings.len(),
            "Batch save"
        );

        let outcome = self
            .prepare(notes, drawings)
            .and_then(|writes| self.db.transaction(|db| self.apply_all(db, &writes)).map(|_| writes));

        match outcome {
            Ok(writes) => {
                for write in &writes {
                    self.db.log_sync(
                        self.device_id,
                        "batch",
                        write.table.as_str(),
                        Some(&write.record_id),
                        SyncLogStatus::Success,
                        None,
                    )?;
                }
                Ok(BatchSaveResponse::succeeded(BatchResults {
                    notes: BatchCounts {
                        succeeded: notes.len() as i64,
                        failed: 0,
                    },
                    drawings: BatchCounts {
                        succeeded: drawings.len() as i64,
                        failed: 0,
                    },
                }))
            }
            Err(e) => {
                tracing::warn!(device_id = self.device_id, "Batch rolled back: {}", e);
                let message = e.to_string();
                self.db.log_sync(self.device_id, "batch", "*", None, SyncLogStatus::Failure, Some(&message))?;
                Ok(BatchSaveResponse::failed(message))
            }
        }
    }

    fn prepare(
        &self,
        notes: &[BatchNoteWrite],
        drawings: &[BatchDrawingWrite],
    ) -> ScheduleResult<Vec<PreparedWrite>> {
        let mut writes = Vec::with_capacity(notes.len() + drawings.len());

        for note in notes {
            let record_id = validate_entity_id(&note.record_ref, "recordRef")?;
            if !self.db.record_is_live(&record_id)? {
                return Err(ScheduleError::not_found(format!("record {}", record_id)));
            }
            if !self.db.device_can_write_record(&record_id, self.device_id)? {
                return Err(ScheduleError::Unauthorized(format!(
                    "device {} may not write the note of record {}",
                    self.device_id, record_id
                )));
            }
            let pages = coerce_json_payload(&note.data, "pages")?;
            writes.push(PreparedWrite {
                table: SyncTable::Notes,
                record_id,
                columns: vec![("pages", SqlValue::Text(pages))],
                expected_version: checked_version(note.version)?,
            });
        }

        for drawing in drawings {
            let book_id = validate_entity_id(&drawing.book_ref, "bookRef")?;
            let date = validate_date(&drawing.date, "date")?;
            let view_mode = ViewMode::parse(&drawing.view_mode).ok_or_else(|| {
                ScheduleError::validation("viewMode", format!("unknown view mode '{}'", drawing.view_mode))
            })?;
            if !self.db.device_can_write_book(&book_id, self.device_id)? {
                return Err(ScheduleError::Unauthorized(format!(
                    "device {} may not write book {}",
                    self.device_id, book_id
                )));
            }
            let strokes = coerce_json_payload(&drawing.data, "strokes")?;
            writes.push(PreparedWrite {
                table: SyncTable::ScheduleDrawings,
                record_id: drawing_key(&book_id, &date, view_mode),
                columns: vec![
                    ("book_id", SqlValue::Text(book_id)),
                    ("date", SqlValue::Text(date)),
                    ("view_mode", SqlValue::Text(view_mode.as_str().to_string())),
                    ("strokes", SqlValue::Text(strokes)),
                ],
                expected_version: checked_version(drawing.version)?,
            });
        }

        Ok(writes)
    }

    fn apply_all(&self, db: &Database, writes: &[PreparedWrite]) -> ScheduleResult<()> {
        let timestamp = now_ms();
        let stamp = SyncStamp {
            device_id: self.device_id,
            timestamp,
            synced_at: self.synced_at,
        };
        for write in writes {
            match db.read_entity(write.table, &write.record_id)? {
                None => {
                    db.insert_synced_entity(
                        write.table,
                        &write.record_id,
                        &write.columns,
                        write.expected_version + 1,
                        false,
                        timestamp,
                        Some(stamp),
                    )?;
                }
                Some(current) => {
                    let written = db.apply_update_if(
                        write.table,
                        &write.record_id,
                        &write.columns,
                        VersionGuard::AtMost(write.expected_version),
                        stamp,
                    )?;
                    if written.is_none() {
                        return Err(ScheduleError::VersionConflict(Box::new(ConflictReport {
                            table: write.table.as_str().to_string(),
                            record_id: write.record_id.clone(),
                            local_data: columns_to_json(write.table, &write.columns),
                            server_data: current.data,
                            local_version: write.expected_version,
                            server_version: current.version,
                            local_timestamp: timestamp,
                            server_timestamp: current.updated_at,
                        })));
                    }
                }
            }
            tracing::trace!(table = %write.table, record_id = %write.record_id, "Batch item written");
        }
        Ok(())
    }
}

fn checked_version(version: i64) -> ScheduleResult<i64> {
    if version < 0 {
        return Err(ScheduleError::validation("version", "cannot be negative"));
    }
    Ok(version)
}
