//! Conflict handling for Schedule sync.
//!
//! This module handles:
//! - Persisting version conflicts the server reported (client side)
//! - Listing and resolving those conflicts
//! - The policy seam a sync client consults when a push conflicts
//! - A structural merge for JSON payloads

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::Database;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{new_id, now_ms, ConflictReport, SyncTable};

/// What a client does with a version conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Adopt the server's data and version, drop the local edit
    KeepServer,
    /// Adopt the server's version as base and push the local data again
    KeepLocal,
    /// Merge local data onto the server's and push the result
    Merge,
    /// Persist the conflict for the user; hold the row back from push
    Surface,
}

impl ConflictPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "keep_server" | "server" => Some(ConflictPolicy::KeepServer),
            "keep_local" | "local" => Some(ConflictPolicy::KeepLocal),
            "merge" => Some(ConflictPolicy::Merge),
            "surface" | "manual" => Some(ConflictPolicy::Surface),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::KeepServer => "keep_server",
            ConflictPolicy::KeepLocal => "keep_local",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Surface => "surface",
        }
    }
}

/// Decides how each reported conflict is handled
pub trait ConflictResolver: Send + Sync {
    fn policy_for(&self, conflict: &ConflictReport) -> ConflictPolicy;
}

impl ConflictResolver for ConflictPolicy {
    fn policy_for(&self, _conflict: &ConflictReport) -> ConflictPolicy {
        *self
    }
}

/// Per-table policies with a fallback
#[derive(Debug, Clone)]
pub struct TablePolicies {
    pub default: ConflictPolicy,
    pub overrides: HashMap<SyncTable, ConflictPolicy>,
}

impl TablePolicies {
    pub fn new(default: ConflictPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, table: SyncTable, policy: ConflictPolicy) -> Self {
        self.overrides.insert(table, policy);
        self
    }
}

impl ConflictResolver for TablePolicies {
    fn policy_for(&self, conflict: &ConflictReport) -> ConflictPolicy {
        SyncTable::parse(&conflict.table)
            .and_then(|t| self.overrides.get(&t).copied())
            .unwrap_or(self.default)
    }
}

/// Merge a local payload onto the server's.
///
/// Objects merge key by key. Arrays keep every server item, then append
/// local items the server does not have, so no page or stroke from either
/// side is lost. For anything else the local value wins.
pub fn merge_payloads(local: &Value, server: &Value) -> Value {
    match (local, server) {
        (Value::Object(l), Value::Object(s)) => {
            let mut merged = s.clone();
            for (key, lv) in l {
                let value = match s.get(key) {
                    Some(sv) => merge_payloads(lv, sv),
                    None => lv.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (Value::Array(l), Value::Array(s)) => {
            let mut merged = s.clone();
            for item in l {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (Value::Null, other) => other.clone(),
        (local, _) => local.clone(),
    }
}

/// A conflict persisted on the client for the user to resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub table: String,
    pub record_id: String,
    pub local_data: Value,
    pub server_data: Value,
    pub local_version: i64,
    pub server_version: i64,
    pub local_timestamp: i64,
    pub server_timestamp: i64,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution: Option<String>,
}

impl SyncConflict {
    pub fn report(&self) -> ConflictReport {
        ConflictReport {
            table: self.table.clone(),
            record_id: self.record_id.clone(),
            local_data: self.local_data.clone(),
            server_data: self.server_data.clone(),
            local_version: self.local_version,
            server_version: self.server_version,
            local_timestamp: self.local_timestamp,
            server_timestamp: self.server_timestamp,
        }
    }
}

const CONFLICT_SELECT: &str = "SELECT id, table_name, record_id, local_data, server_data, \
     local_version, server_version, local_timestamp, server_timestamp, created_at, \
     resolved_at, resolution FROM sync_conflicts";

fn row_to_conflict(row: &Row) -> rusqlite::Result<SyncConflict> {
    let local_data: String = row.get(3)?;
    let server_data: String = row.get(4)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        local_data: serde_json::from_str(&local_data).unwrap_or(Value::Null),
        server_data: serde_json::from_str(&server_data).unwrap_or(Value::Null),
        local_version: row.get(5)?,
        server_version: row.get(6)?,
        local_timestamp: row.get(7)?,
        server_timestamp: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
        resolution: row.get(11)?,
    })
}

/// Conflict manager
pub struct ConflictManager<'a> {
    db: &'a Database,
}

impl<'a> ConflictManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist a reported conflict. A row has at most one open conflict; a
    /// newer report for the same row replaces the open one.
    pub fn record_conflict(&self, report: &ConflictReport) -> ScheduleResult<String> {
        let conn = self.db.connection();
        let local_data = serde_json::to_string(&report.local_data)?;
        let server_data = serde_json::to_string(&report.server_data)?;

        if let Some(existing) = self.find_open(&report.table, &report.record_id)? {
            conn.execute(
                "UPDATE sync_conflicts SET local_data = ?, server_data = ?, local_version = ?, \
                 server_version = ?, local_timestamp = ?, server_timestamp = ? WHERE id = ?",
                params![
                    local_data,
                    server_data,
                    report.local_version,
                    report.server_version,
                    report.local_timestamp,
                    report.server_timestamp,
                    existing.id
                ],
            )?;
            return Ok(existing.id);
        }

        let id = new_id();
        conn.execute(
            "INSERT INTO sync_conflicts (id, table_name, record_id, local_data, server_data, \
             local_version, server_version, local_timestamp, server_timestamp, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                report.table,
                report.record_id,
                local_data,
                server_data,
                report.local_version,
                report.server_version,
                report.local_timestamp,
                report.server_timestamp,
                now_ms()
            ],
        )?;
        tracing::debug!(conflict_id = %id, table = %report.table, record_id = %report.record_id, "Recorded conflict");
        Ok(id)
    }

    /// The open conflict for a row, if any
    pub fn find_open(&self, table: &str, record_id: &str) -> ScheduleResult<Option<SyncConflict>> {
        let sql = format!(
            "{} WHERE table_name = ? AND record_id = ? AND resolved_at IS NULL",
            CONFLICT_SELECT
        );
        Ok(self
            .db
            .connection()
            .query_row(&sql, params![table, record_id], row_to_conflict)
            .optional()?)
    }

    /// Get a conflict by ID or unique ID prefix
    pub fn get_conflict(&self, id_or_prefix: &str) -> ScheduleResult<SyncConflict> {
        let sql = format!("{} WHERE id LIKE ? || '%' ORDER BY created_at", CONFLICT_SELECT);
        let mut stmt = self.db.connection().prepare(&sql)?;
        let mut matches = stmt
            .query_map(params![id_or_prefix], row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        match matches.len() {
            0 => Err(ScheduleError::not_found(format!(
                "conflict with ID starting with '{}'",
                id_or_prefix
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(ScheduleError::validation(
                "conflict_id",
                format!("prefix '{}' matches {} conflicts", id_or_prefix, n),
            )),
        }
    }

    /// List conflicts, newest first
    pub fn get_conflicts(&self, include_resolved: bool) -> ScheduleResult<Vec<SyncConflict>> {
        let sql = if include_resolved {
            format!("{} ORDER BY created_at DESC", CONFLICT_SELECT)
        } else {
            format!("{} WHERE resolved_at IS NULL ORDER BY created_at DESC", CONFLICT_SELECT)
        };
        let mut stmt = self.db.connection().prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of unresolved conflicts by table, plus "total"
    pub fn get_unresolved_count(&self) -> ScheduleResult<HashMap<String, i64>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT table_name, COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL \
             GROUP BY table_name",
        )?;
        let mut counts = HashMap::new();
        let mut total = 0;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (table, count) = row?;
            total += count;
            counts.insert(table, count);
        }
        counts.insert("total".to_string(), total);
        Ok(counts)
    }

    /// Close a conflict with the chosen resolution
    pub fn mark_resolved(&self, conflict_id: &str, resolution: &str) -> ScheduleResult<bool> {
        let changed = self.db.connection().execute(
            "UPDATE sync_conflicts SET resolved_at = ?, resolution = ? \
             WHERE id = ? AND resolved_at IS NULL",
            params![now_ms(), resolution, conflict_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(record_id: &str, server_version: i64) -> ConflictReport {
        ConflictReport {
            table: "notes".to_string(),
            record_id: record_id.to_string(),
            local_data: json!({"pages": [["local"]]}),
            server_data: json!({"pages": [["server"]]}),
            local_version: 1,
            server_version,
            local_timestamp: 10,
            server_timestamp: 20,
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(ConflictPolicy::from_str("keep_server"), Some(ConflictPolicy::KeepServer));
        assert_eq!(ConflictPolicy::from_str("LOCAL"), Some(ConflictPolicy::KeepLocal));
        assert_eq!(ConflictPolicy::from_str("surface"), Some(ConflictPolicy::Surface));
        assert_eq!(ConflictPolicy::from_str("keep_both"), None);
    }

    #[test]
    fn test_table_policies() {
        let policies = TablePolicies::new(ConflictPolicy::KeepServer)
            .with(SyncTable::Notes, ConflictPolicy::Surface);
        assert_eq!(policies.policy_for(&report("a", 2)), ConflictPolicy::Surface);

        let mut other = report("a", 2);
        other.table = "events".to_string();
        assert_eq!(policies.policy_for(&other), ConflictPolicy::KeepServer);
    }

    #[test]
    fn test_merge_keeps_both_sides() {
        let merged = merge_payloads(
            &json!({"pages": [["a"], ["local"]], "title": "mine"}),
            &json!({"pages": [["a"], ["server"]], "title": "theirs", "extra": 1}),
        );
        assert_eq!(merged["pages"], json!([["a"], ["server"], ["local"]]));
        assert_eq!(merged["title"], json!("mine"));
        assert_eq!(merged["extra"], json!(1));
    }

    #[test]
    fn test_record_conflict_replaces_open_one() {
        let db = Database::new_in_memory().unwrap();
        let manager = ConflictManager::new(&db);

        let first = manager.record_conflict(&report("r1", 2)).unwrap();
        let second = manager.record_conflict(&report("r1", 3)).unwrap();
        assert_eq!(first, second);

        let open = manager.get_conflicts(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].server_version, 3);
        assert_eq!(open[0].server_data, json!({"pages": [["server"]]}));
    }

    #[test]
    fn test_get_conflict_by_prefix_and_resolve() {
        let db = Database::new_in_memory().unwrap();
        let manager = ConflictManager::new(&db);
        let id = manager.record_conflict(&report("r1", 2)).unwrap();

        let found = manager.get_conflict(&id[..12]).unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.report().server_version, 2);

        assert!(manager.mark_resolved(&id, "use_server").unwrap());
        assert!(!manager.mark_resolved(&id, "use_server").unwrap());
        assert!(manager.get_conflicts(false).unwrap().is_empty());
        assert_eq!(manager.get_conflicts(true).unwrap().len(), 1);
        assert!(matches!(
            manager.get_conflict("ffff"),
            Err(ScheduleError::NotFound(_))
        ));
    }

    #[test]
    fn test_unresolved_count() {
        let db = Database::new_in_memory().unwrap();
        let manager = ConflictManager::new(&db);
        manager.record_conflict(&report("r1", 2)).unwrap();
        manager.record_conflict(&report("r2", 2)).unwrap();

        let counts = manager.get_unresolved_count().unwrap();
        assert_eq!(counts.get("notes"), Some(&2));
        assert_eq!(counts.get("total"), Some(&2));
    }
}
