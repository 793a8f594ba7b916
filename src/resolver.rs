//! Person/record note resolution.
//!
//! Notes belong to records, not events: every event of the same person
//! shows the same note. This module resolves an event to its record's note,
//! guards existing handwriting when a new event is created for a known
//! record, and migrates the legacy per-event note table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheManager;
use crate::database::Database;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{pages_have_content, Event, Note, Record, SyncTable};

/// Legacy per-event note table
pub const LEGACY_EVENT_NOTES_TABLE: &str = "event_notes";

/// schema_meta flag set once the legacy notes are migrated
pub const EVENT_NOTES_MIGRATED_FLAG: &str = "event_notes_migrated";

/// What to do when a new event's record already has a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteChoice {
    /// Overwrite the record's note with the draft
    KeepDraft,
    /// Discard the draft and keep the record's note
    LoadExisting,
}

/// A new event together with the handwriting drawn for it
#[derive(Debug, Clone, PartialEq)]
pub struct EventNoteDraft {
    pub book_id: String,
    pub record_number: String,
    pub name: Option<String>,
    pub title: Option<String>,
    pub start_at: i64,
    pub end_at: Option<i64>,
    pub event_types: Vec<String>,
    pub pages: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoteSaveOutcome {
    Saved { event: Event, note: Option<Note> },
    /// The record already has content; nothing was written
    NeedsConfirmation { existing: Note },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Records that received migrated pages
    pub records: usize,
    /// Legacy rows folded into those records
    pub legacy_notes: usize,
    /// Legacy rows whose event is unknown or whose pages are unreadable
    pub skipped: usize,
}

/// Note resolver
pub struct NoteResolver<'a> {
    db: &'a Database,
}

impl<'a> NoteResolver<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// The note of the event's record, created empty on first access.
    ///
    /// A note that was evicted from the cache is not recreated empty; it
    /// reports `NotFound` until it is fetched back from the server.
    pub fn note_for_event(&self, event_id: &str) -> ScheduleResult<Note> {
        let event = self
            .db
            .get_event(event_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("event {}", event_id)))?;
        let cache = CacheManager::new(self.db);
        if self.db.get_note(&event.record_id)?.is_none() && cache.was_evicted(SyncTable::Notes, &event.record_id)? {
            return Err(ScheduleError::not_found(format!(
                "note for record {} is not cached",
                event.record_id
            )));
        }
        self.db.ensure_note_row(&event.record_id)?;
        cache.increment_hit(SyncTable::Notes, &event.record_id)?;
        self.db
            .get_note(&event.record_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("note for record {}", event.record_id)))
    }

    pub fn ensure_record_for_event(&self, record_number: &str, name: Option<&str>) -> ScheduleResult<Record> {
        self.db.ensure_record(record_number, name, None)
    }

    /// The record's note when it already holds handwriting
    pub fn check_existing_note(&self, record_number: &str, name: Option<&str>) -> ScheduleResult<Option<Note>> {
        let Some(record) = self.db.find_record(record_number, name)? else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_note(&record.id)?
            .filter(|note| !note.is_deleted && note.has_content()))
    }

    /// Create an event and store its handwriting on the record's note.
    ///
    /// If the record already has a non-empty note and no choice was made,
    /// nothing is written and the existing note is returned for the caller
    /// to show.
    pub fn save_new_event_note(
        &self,
        draft: &EventNoteDraft,
        choice: Option<NoteChoice>,
    ) -> ScheduleResult<NoteSaveOutcome> {
        let existing = self.check_existing_note(&draft.record_number, draft.name.as_deref())?;
        if let (Some(existing), None) = (&existing, choice) {
            return Ok(NoteSaveOutcome::NeedsConfirmation {
                existing: existing.clone(),
            });
        }

        self.db.transaction(|db| {
            let record = db.ensure_record(&draft.record_number, draft.name.as_deref(), None)?;
            let mut event = Event::new(draft.book_id.clone(), record.id.clone(), draft.start_at, draft.end_at);
            event.title = draft.title.clone();
            event.event_types = draft.event_types.clone();
            let event = db.create_event(event)?;

            let write_draft = match choice {
                Some(NoteChoice::LoadExisting) => false,
                Some(NoteChoice::KeepDraft) => true,
                None => pages_have_content(&draft.pages),
            };
            let note = if write_draft {
                Some(db.save_note(&record.id, &draft.pages)?)
            } else {
                db.get_note(&record.id)?
            };
            Ok(NoteSaveOutcome::Saved { event, note })
        })
    }

    /// Fold the legacy per-event notes into per-record notes.
    ///
    /// Pages are concatenated in update order, identical pages dropped, and
    /// appended after any pages the record's note already has. The legacy
    /// table is dropped afterwards. Runs at most once.
    pub fn migrate_event_notes(&self) -> ScheduleResult<MigrationReport> {
        if self.db.get_meta(EVENT_NOTES_MIGRATED_FLAG)?.is_some() {
            return Ok(MigrationReport::default());
        }

        self.db.transaction(|db| {
            let mut report = MigrationReport::default();
            if db.table_exists(LEGACY_EVENT_NOTES_TABLE)? {
                let rows = {
                    let mut stmt = db.connection().prepare(
                        "SELECT e.record_id, n.pages
                         FROM event_notes n
                         LEFT JOIN events e ON e.id = n.event_id
                         ORDER BY n.updated_at ASC, n.event_id ASC",
                    )?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut by_record: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for (record_id, pages) in rows {
                    let parsed = pages.and_then(|p| serde_json::from_str::<Value>(&p).ok());
                    match (record_id, parsed) {
                        (Some(record_id), Some(Value::Array(pages))) => {
                            by_record.entry(record_id).or_default().extend(pages);
                            report.legacy_notes += 1;
                        }
                        _ => report.skipped += 1,
                    }
                }

                for (record_id, legacy_pages) in by_record {
                    let mut pages = match db.get_note(&record_id)? {
                        Some(note) => match note.pages {
                            Value::Array(existing) => existing,
                            _ => Vec::new(),
                        },
                        None => Vec::new(),
                    };
                    for page in legacy_pages {
                        if !pages.contains(&page) {
                            pages.push(page);
                        }
                    }
                    if !pages_have_content(&Value::Array(pages.clone())) {
                        continue;
                    }
                    if !db.record_is_live(&record_id)? {
                        report.skipped += 1;
                        continue;
                    }
                    db.save_note(&record_id, &Value::Array(pages))?;
                    report.records += 1;
                }

                db.connection().execute_batch("DROP TABLE event_notes;")?;
            }
            db.set_meta(EVENT_NOTES_MIGRATED_FLAG, "1")?;
            tracing::debug!(?report, "Migrated legacy event notes");
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use rusqlite::types::Value as SqlValue;
    use serde_json::json;

    fn draft(book_id: &str, pages: Value) -> EventNoteDraft {
        EventNoteDraft {
            book_id: book_id.to_string(),
            record_number: "R-42".to_string(),
            name: Some("Ada".to_string()),
            title: None,
            start_at: 1_000,
            end_at: None,
            event_types: vec![],
            pages,
        }
    }

    #[test]
    fn test_events_of_same_record_share_note() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let record = db.ensure_record("R-1", None, None).unwrap();
        let first = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1, None))
            .unwrap();
        let second = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 2, None))
            .unwrap();

        let resolver = NoteResolver::new(&db);
        db.save_note(&record.id, &json!([["hello"]])).unwrap();

        let a = resolver.note_for_event(&first.id).unwrap();
        let b = resolver.note_for_event(&second.id).unwrap();
        assert_eq!(a.record_id, b.record_id);
        assert_eq!(b.pages, json!([["hello"]]));
    }

    #[test]
    fn test_note_for_event_creates_empty_note() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let record = db.ensure_record("R-1", None, None).unwrap();
        let event = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1, None))
            .unwrap();

        let note = NoteResolver::new(&db).note_for_event(&event.id).unwrap();
        assert!(!note.has_content());
        assert!(!note.is_dirty);
        assert!(NoteResolver::new(&db).note_for_event("missing").is_err());
    }

    #[test]
    fn test_evicted_note_is_not_recreated_empty() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let record = db.ensure_record("R-1", None, None).unwrap();
        let event = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1, None))
            .unwrap();
        db.insert_synced_entity(
            SyncTable::Notes,
            &record.id,
            &[("pages", SqlValue::Text(r#"[["kept"]]"#.to_string()))],
            3,
            false,
            0,
            None,
        )
        .unwrap();
        assert_eq!(CacheManager::new(&db).evict_lowest(1).unwrap(), 1);

        let resolver = NoteResolver::new(&db);
        assert!(matches!(resolver.note_for_event(&event.id), Err(ScheduleError::NotFound(_))));
        assert!(db.get_note(&record.id).unwrap().is_none());
    }

    #[test]
    fn test_new_event_needs_confirmation_over_existing_note() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let resolver = NoteResolver::new(&db);

        let first = resolver
            .save_new_event_note(&draft(&book.id, json!([["original"]])), None)
            .unwrap();
        assert!(matches!(first, NoteSaveOutcome::Saved { note: Some(_), .. }));

        let outcome = resolver
            .save_new_event_note(&draft(&book.id, json!([["draft"]])), None)
            .unwrap();
        let NoteSaveOutcome::NeedsConfirmation { existing } = outcome else {
            panic!("expected confirmation");
        };
        assert_eq!(existing.pages, json!([["original"]]));
        // Nothing written: still one event for the record
        assert_eq!(db.get_events_for_record(&existing.record_id).unwrap().len(), 1);
    }

    #[test]
    fn test_load_existing_keeps_note() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let resolver = NoteResolver::new(&db);
        resolver
            .save_new_event_note(&draft(&book.id, json!([["original"]])), None)
            .unwrap();

        let outcome = resolver
            .save_new_event_note(&draft(&book.id, json!([["draft"]])), Some(NoteChoice::LoadExisting))
            .unwrap();
        let NoteSaveOutcome::Saved { event, note } = outcome else {
            panic!("expected save");
        };
        assert_eq!(note.unwrap().pages, json!([["original"]]));
        assert_eq!(db.get_events_for_record(&event.record_id).unwrap().len(), 2);
    }

    #[test]
    fn test_keep_draft_overwrites_note() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let resolver = NoteResolver::new(&db);
        resolver
            .save_new_event_note(&draft(&book.id, json!([["original"]])), None)
            .unwrap();

        resolver
            .save_new_event_note(&draft(&book.id, json!([["draft"]])), Some(NoteChoice::KeepDraft))
            .unwrap();
        let note = resolver.check_existing_note("R-42", Some("Ada")).unwrap().unwrap();
        assert_eq!(note.pages, json!([["draft"]]));
    }

    #[test]
    fn test_migrate_event_notes_once() {
        let db = Database::new_in_memory().unwrap();
        let book = db.create_book("Clinic").unwrap();
        let record = db.ensure_record("R-1", None, None).unwrap();
        let e1 = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 1, None))
            .unwrap();
        let e2 = db
            .create_event(Event::new(book.id.clone(), record.id.clone(), 2, None))
            .unwrap();

        db.connection()
            .execute_batch(
                "CREATE TABLE event_notes (event_id TEXT PRIMARY KEY, pages TEXT, updated_at INTEGER);",
            )
            .unwrap();
        let insert = "INSERT INTO event_notes (event_id, pages, updated_at) VALUES (?, ?, ?)";
        db.connection().execute(insert, params![e2.id, r#"[["second"],["shared"]]"#, 20]).unwrap();
        db.connection().execute(insert, params![e1.id, r#"[["first"],["shared"]]"#, 10]).unwrap();
        db.connection().execute(insert, params!["orphan", r#"[["lost"]]"#, 30]).unwrap();

        let resolver = NoteResolver::new(&db);
        let report = resolver.migrate_event_notes().unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.legacy_notes, 2);
        assert_eq!(report.skipped, 1);

        let note = db.get_note(&record.id).unwrap().unwrap();
        assert_eq!(note.pages, json!([["first"], ["shared"], ["second"]]));
        assert!(note.is_dirty);
        assert!(!db.table_exists("event_notes").unwrap());

        // Second run is a no-op
        assert_eq!(resolver.migrate_event_notes().unwrap(), MigrationReport::default());
    }
}
