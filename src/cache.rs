//! Cache management for notes and schedule drawings.
//!
//! Pulled notes and drawings are cached locally and evicted by age (TTL) and
//! by total payload size, least used first. Rows with unsynced edits are
//! never evicted: every delete statement carries an `is_dirty = 0` guard.
//!
//! Each eviction leaves a marker in `evicted_rows` so readers can tell an
//! evicted row (refetch it from the server) from one that never existed.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{now_ms, CachePolicy, SyncTable};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Minimum spacing between automatic cleanups
pub const AUTO_CLEANUP_INTERVAL_MS: i64 = DAY_MS;

/// What one cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired: usize,
    pub over_budget: usize,
    pub bytes_after: i64,
}

/// An evictable cached row
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    table: SyncTable,
    key: String,
    size: i64,
}

/// Cache manager
pub struct CacheManager<'a> {
    db: &'a Database,
}

impl<'a> CacheManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn get_policy(&self) -> ScheduleResult<CachePolicy> {
        Ok(self.db.connection().query_row(
            "SELECT max_cache_size_mb, cache_duration_days, auto_cleanup, last_cleanup_at
             FROM cache_policy WHERE id = 1",
            [],
            |row| {
                Ok(CachePolicy {
                    max_cache_size_mb: row.get(0)?,
                    cache_duration_days: row.get(1)?,
                    auto_cleanup: row.get(2)?,
                    last_cleanup_at: row.get(3)?,
                })
            },
        )?)
    }

    pub fn set_policy(&self, policy: &CachePolicy) -> ScheduleResult<()> {
        if policy.max_cache_size_mb < 0 {
            return Err(ScheduleError::validation("max_cache_size_mb", "cannot be negative"));
        }
        if policy.cache_duration_days < 0 {
            return Err(ScheduleError::validation("cache_duration_days", "cannot be negative"));
        }
        self.db.connection().execute(
            "UPDATE cache_policy SET max_cache_size_mb = ?, cache_duration_days = ?,
                 auto_cleanup = ?, last_cleanup_at = ?
             WHERE id = 1",
            params![
                policy.max_cache_size_mb,
                policy.cache_duration_days,
                policy.auto_cleanup,
                policy.last_cleanup_at
            ],
        )?;
        Ok(())
    }

    fn cacheable(table: SyncTable) -> ScheduleResult<&'static str> {
        table.payload_column().ok_or_else(|| {
            ScheduleError::validation("table", format!("{} is not a cached table", table))
        })
    }

    /// Count a cache read
    pub fn increment_hit(&self, table: SyncTable, key: &str) -> ScheduleResult<()> {
        Self::cacheable(table)?;
        let sql = format!(
            "UPDATE {} SET cache_hit_count = cache_hit_count + 1 WHERE {} = ?",
            table.as_str(),
            table.key_column()
        );
        self.db.connection().execute(&sql, params![key])?;
        Ok(())
    }

    /// Total payload bytes held in the cached tables
    pub fn cache_size_bytes(&self) -> ScheduleResult<i64> {
        let mut total = 0;
        for table in SyncTable::ALL.into_iter().filter(SyncTable::is_cacheable) {
            let column = Self::cacheable(table)?;
            let sql = format!("SELECT COALESCE(SUM(LENGTH({})), 0) FROM {}", column, table.as_str());
            let size: i64 = self.db.connection().query_row(&sql, [], |row| row.get(0))?;
            total += size;
        }
        Ok(total)
    }

    /// Clean rows ranked for eviction: least hit first, then oldest
    fn candidates(&self) -> ScheduleResult<Vec<Candidate>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT 'notes', record_id, LENGTH(pages), cache_hit_count, COALESCE(cached_at, 0)
             FROM notes WHERE is_dirty = 0
             UNION ALL
             SELECT 'schedule_drawings', drawing_key, LENGTH(strokes), cache_hit_count,
                    COALESCE(cached_at, 0)
             FROM schedule_drawings WHERE is_dirty = 0
             ORDER BY 4 ASC, 5 ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let table: String = row.get(0)?;
                Ok((table, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(table, key, size)| {
                SyncTable::parse(&table).map(|table| Candidate { table, key, size })
            })
            .collect())
    }

    fn evict(&self, candidate: &Candidate) -> ScheduleResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ? AND is_dirty = 0",
            candidate.table.as_str(),
            candidate.table.key_column()
        );
        self.db.transaction(|db| {
            let deleted = db.connection().execute(&sql, params![candidate.key])? > 0;
            if deleted {
                self.mark_evicted(candidate.table, &candidate.key, now_ms())?;
            }
            Ok(deleted)
        })
    }

    fn mark_evicted(&self, table: SyncTable, key: &str, at: i64) -> ScheduleResult<()> {
        self.db.connection().execute(
            "INSERT OR REPLACE INTO evicted_rows (table_name, row_key, evicted_at) VALUES (?, ?, ?)",
            params![table.as_str(), key, at],
        )?;
        Ok(())
    }

    /// Whether the row was dropped by eviction and not restored since
    pub fn was_evicted(&self, table: SyncTable, key: &str) -> ScheduleResult<bool> {
        let found: i64 = self.db.connection().query_row(
            "SELECT COUNT(*) FROM evicted_rows WHERE table_name = ? AND row_key = ?",
            params![table.as_str(), key],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    /// Drop the eviction marker once the row is back (or known to be gone)
    pub fn forget_eviction(&self, table: SyncTable, key: &str) -> ScheduleResult<()> {
        self.db.connection().execute(
            "DELETE FROM evicted_rows WHERE table_name = ? AND row_key = ?",
            params![table.as_str(), key],
        )?;
        Ok(())
    }

    /// Delete clean cached rows older than the policy's duration
    pub fn evict_expired(&self, now: i64) -> ScheduleResult<usize> {
        let policy = self.get_policy()?;
        let cutoff = now - policy.cache_duration_days.saturating_mul(DAY_MS);
        let mut evicted = 0;
        for table in SyncTable::ALL.into_iter().filter(SyncTable::is_cacheable) {
            let sql = format!(
                "DELETE FROM {} WHERE is_dirty = 0 AND cached_at IS NOT NULL AND cached_at < ?
                 RETURNING {}",
                table.as_str(),
                table.key_column()
            );
            evicted += self.db.transaction(|db| {
                let mut stmt = db.connection().prepare(&sql)?;
                let keys = stmt
                    .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                for key in &keys {
                    self.mark_evicted(table, key, now)?;
                }
                Ok(keys.len())
            })?;
        }
        tracing::debug!(evicted, cutoff, "Evicted expired cache rows");
        Ok(evicted)
    }

    /// Delete the lowest ranked clean rows until the cache fits the budget.
    /// Dirty rows still count toward the size but are never removed.
    pub fn evict_to_budget(&self) -> ScheduleResult<usize> {
        let budget = self.get_policy()?.max_cache_size_bytes();
        let mut size = self.cache_size_bytes()?;
        let mut evicted = 0;
        for candidate in self.candidates()? {
            if size <= budget {
                break;
            }
            if self.evict(&candidate)? {
                size -= candidate.size;
                evicted += 1;
            }
        }
        tracing::debug!(evicted, size, budget, "Evicted cache rows over budget");
        Ok(evicted)
    }

    /// Delete exactly the `n` lowest ranked clean rows (fewer if there are
    /// not that many)
    pub fn evict_lowest(&self, n: usize) -> ScheduleResult<usize> {
        let mut evicted = 0;
        for candidate in self.candidates()?.into_iter().take(n) {
            if self.evict(&candidate)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Run TTL then size eviction and stamp the cleanup time
    pub fn cleanup(&self, now: i64) -> ScheduleResult<CleanupReport> {
        let expired = self.evict_expired(now)?;
        let over_budget = self.evict_to_budget()?;
        self.db.connection().execute(
            "UPDATE cache_policy SET last_cleanup_at = ? WHERE id = 1",
            params![now],
        )?;
        let report = CleanupReport {
            expired,
            over_budget,
            bytes_after: self.cache_size_bytes()?,
        };
        tracing::debug!(?report, "Cache cleanup finished");
        Ok(report)
    }

    /// Run `cleanup` if auto cleanup is on and the last run is older than a day
    pub fn run_if_due(&self, now: i64) -> ScheduleResult<Option<CleanupReport>> {
        let policy = self.get_policy()?;
        if !policy.auto_cleanup {
            return Ok(None);
        }
        let due = policy
            .last_cleanup_at
            .map_or(true, |last| now - last >= AUTO_CLEANUP_INTERVAL_MS);
        if !due {
            return Ok(None);
        }
        self.cleanup(now).map(Some)
    }
}
