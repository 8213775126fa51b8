//! SQLite persistence for automation history, the rescrape queue and
//! per-provider source statistics.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::history::HistoryEntry;
use crate::model::Provider;
use crate::rescrape_queue::QueueEntry;
use crate::source_stats::SourceStats;

const DATA_DIR_NAME: &str = "autoscrape";
const DB_FILE_NAME: &str = "autoscrape.db";

/// Owns the single SQLite connection. The mutex is never held across an
/// `.await`; every method is one short critical section.
pub struct DbManager {
    conn: Mutex<Connection>,
}

impl DbManager {
    /// Opens `<data dir>/autoscrape/autoscrape.db`, creating it if needed.
    pub fn open_default() -> Result<Self, StoreError> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not find data directory",
                ))
            })?
            .join(DATA_DIR_NAME);
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir)?;
        }
        Self::open(&data_dir.join(DB_FILE_NAME))
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!("Opening automation database at {}", path.display());
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db_manager = Self {
            conn: Mutex::new(conn),
        };
        db_manager.initialize_schema()?;
        db_manager.migrate()?;
        Ok(db_manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                record_title TEXT NOT NULL DEFAULT '',
                timestamp_ms INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL,
                sources_used TEXT NOT NULL DEFAULT '[]',
                skipped_sources TEXT NOT NULL DEFAULT '[]',
                fields_updated INTEGER NOT NULL DEFAULT 0,
                warnings_count INTEGER NOT NULL DEFAULT 0,
                errors TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS history_record_idx ON history(record_id, timestamp_ms)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rescrape_queue (
                record_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                next_attempt_ms INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_ms INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS source_stats (
                provider TEXT PRIMARY KEY,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_ms INTEGER
            )",
            [],
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        // Databases created before cancellation tracking lack the column.
        let conn = self.conn()?;
        let mut stmt = conn.prepare("PRAGMA table_info(history)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut has_cancelled = false;
        for col in columns {
            if col? == "cancelled" {
                has_cancelled = true;
                break;
            }
        }
        drop(stmt);

        if !has_cancelled {
            conn.execute(
                "ALTER TABLE history ADD COLUMN cancelled INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }
        Ok(())
    }

    // History

    fn insert_history_row(conn: &Connection, entry: &HistoryEntry) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO history (
                id, record_id, record_title, timestamp_ms, duration_ms, success, cancelled,
                sources_used, skipped_sources, fields_updated, warnings_count, errors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.id,
                entry.record_id,
                entry.record_title,
                entry.timestamp,
                entry.duration_ms,
                entry.success,
                entry.cancelled,
                serde_json::to_string(&entry.sources_used)?,
                serde_json::to_string(&entry.skipped_sources)?,
                entry.fields_updated as i64,
                entry.warnings_count as i64,
                serde_json::to_string(&entry.errors)?,
            ],
        )?;
        Ok(())
    }

    pub fn insert_history_entry(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        Self::insert_history_row(&conn, entry)
    }

    /// Deletes the oldest rows beyond `max_entries`. Returns rows removed.
    pub fn trim_history(&self, max_entries: usize) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM history WHERE id NOT IN (
                SELECT id FROM history ORDER BY timestamp_ms DESC, rowid DESC LIMIT ?1
            )",
            params![max_entries as i64],
        )?;
        Ok(removed)
    }

    /// All history rows, oldest first.
    pub fn get_history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, record_id, record_title, timestamp_ms, duration_ms, success, cancelled,
                    sources_used, skipped_sources, fields_updated, warnings_count, errors
             FROM history ORDER BY timestamp_ms ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                id,
                record_id,
                record_title,
                timestamp,
                duration_ms,
                success,
                cancelled,
                sources_used,
                skipped_sources,
                fields_updated,
                warnings_count,
                errors,
            ) = row?;
            let sources_used = serde_json::from_str(&sources_used).unwrap_or_else(|err| {
                warn!("History row {} has unreadable sources: {}", id, err);
                Vec::new()
            });
            let skipped_sources = serde_json::from_str(&skipped_sources).unwrap_or_default();
            let errors = serde_json::from_str(&errors).unwrap_or_default();
            entries.push(HistoryEntry {
                id,
                record_id,
                record_title,
                timestamp,
                duration_ms,
                success,
                cancelled,
                sources_used,
                skipped_sources,
                fields_updated: fields_updated.max(0) as usize,
                warnings_count: warnings_count.max(0) as usize,
                errors,
            });
        }
        Ok(entries)
    }

    /// Atomically replaces every history row.
    pub fn replace_history(&self, entries: &[HistoryEntry]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM history", [])?;
        for entry in entries {
            Self::insert_history_row(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_history(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM history", [])?)
    }

    // Rescrape queue

    pub fn upsert_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rescrape_queue (record_id, reason, next_attempt_ms, attempt_count, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(record_id) DO UPDATE SET
                reason = excluded.reason,
                next_attempt_ms = excluded.next_attempt_ms,
                attempt_count = excluded.attempt_count",
            params![
                entry.record_id,
                entry.reason,
                entry.next_attempt_ms,
                entry.attempt_count,
                entry.created_ms,
            ],
        )?;
        Ok(())
    }

    pub fn get_queue_entry(&self, record_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT record_id, reason, next_attempt_ms, attempt_count, created_ms
                 FROM rescrape_queue WHERE record_id = ?1",
                params![record_id],
                Self::queue_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// All queue entries, soonest attempt first.
    pub fn get_queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, reason, next_attempt_ms, attempt_count, created_ms
             FROM rescrape_queue ORDER BY next_attempt_ms ASC, record_id ASC",
        )?;
        let rows = stmt.query_map([], Self::queue_entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn queue_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
        Ok(QueueEntry {
            record_id: row.get(0)?,
            reason: row.get(1)?,
            next_attempt_ms: row.get(2)?,
            attempt_count: row.get(3)?,
            created_ms: row.get(4)?,
        })
    }

    pub fn delete_queue_entry(&self, record_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM rescrape_queue WHERE record_id = ?1",
            params![record_id],
        )?;
        Ok(removed > 0)
    }

    pub fn clear_queue(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM rescrape_queue", [])?)
    }

    // Source stats

    pub fn get_source_stats(&self) -> Result<HashMap<Provider, SourceStats>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider, success_count, fail_count, last_attempt_ms FROM source_stats",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                SourceStats {
                    success_count: row.get::<_, i64>(1)?.max(0) as u64,
                    fail_count: row.get::<_, i64>(2)?.max(0) as u64,
                    last_attempt_ms: row.get(3)?,
                },
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (provider_key, provider_stats) = row?;
            match provider_key.parse::<Provider>() {
                Ok(provider) => {
                    stats.insert(provider, provider_stats);
                }
                Err(err) => warn!("Ignoring stats row: {}", err),
            }
        }
        Ok(stats)
    }

    pub fn upsert_source_stats(
        &self,
        provider: Provider,
        stats: &SourceStats,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO source_stats (provider, success_count, fail_count, last_attempt_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider) DO UPDATE SET
                success_count = excluded.success_count,
                fail_count = excluded.fail_count,
                last_attempt_ms = excluded.last_attempt_ms",
            params![
                provider.key(),
                stats.success_count as i64,
                stats.fail_count as i64,
                stats.last_attempt_ms,
            ],
        )?;
        Ok(())
    }

    pub fn clear_source_stats(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM source_stats", [])?)
    }
}
