//! Persisted schedule of scenes to revisit after a retry interval.
//!
//! Backoff is capped and linear: every reschedule lands at
//! `now + min(max_backoff, retry_interval)`. Entries only leave the queue
//! through `remove` or `clear`.

use std::sync::Arc;

use log::{debug, info};

use crate::config::QueueConfig;
use crate::db_manager::DbManager;
use crate::error::StoreError;
use crate::model::now_unix_ms;

const MS_PER_MINUTE: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub record_id: String,
    pub reason: String,
    pub next_attempt_ms: i64,
    pub attempt_count: u32,
    pub created_ms: i64,
}

impl QueueEntry {
    pub fn is_due_at(&self, now_ms: i64) -> bool {
        self.next_attempt_ms <= now_ms
    }
}

pub struct RescrapeQueue {
    db: Arc<DbManager>,
    retry_interval_minutes: u32,
    max_backoff_minutes: u32,
}

impl RescrapeQueue {
    pub fn new(db: Arc<DbManager>, config: &QueueConfig) -> Self {
        Self {
            db,
            retry_interval_minutes: config.retry_interval_minutes.max(1),
            max_backoff_minutes: config.max_backoff_minutes.max(1),
        }
    }

    fn retry_delay_ms(&self) -> i64 {
        i64::from(self.retry_interval_minutes) * MS_PER_MINUTE
    }

    fn backoff_delay_ms(&self) -> i64 {
        i64::from(self.max_backoff_minutes.min(self.retry_interval_minutes)) * MS_PER_MINUTE
    }

    pub fn enqueue(&self, record_id: &str, reason: &str) -> Result<QueueEntry, StoreError> {
        self.enqueue_at(record_id, reason, now_unix_ms())
    }

    /// Inserts a new entry, or updates the reason and resets the schedule of
    /// an existing one.
    pub fn enqueue_at(
        &self,
        record_id: &str,
        reason: &str,
        now_ms: i64,
    ) -> Result<QueueEntry, StoreError> {
        let next_attempt_ms = now_ms.saturating_add(self.retry_delay_ms());
        let entry = match self.db.get_queue_entry(record_id)? {
            Some(existing) => QueueEntry {
                reason: reason.to_string(),
                next_attempt_ms,
                ..existing
            },
            None => QueueEntry {
                record_id: record_id.to_string(),
                reason: reason.to_string(),
                next_attempt_ms,
                attempt_count: 0,
                created_ms: now_ms,
            },
        };
        self.db.upsert_queue_entry(&entry)?;
        info!(
            "Rescrape queued for scene:{} ({}), next attempt at {}",
            record_id, reason, entry.next_attempt_ms
        );
        Ok(entry)
    }

    pub fn due_entry(&self, record_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        self.due_entry_at(record_id, now_unix_ms())
    }

    pub fn due_entry_at(
        &self,
        record_id: &str,
        now_ms: i64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self
            .db
            .get_queue_entry(record_id)?
            .filter(|entry| entry.is_due_at(now_ms)))
    }

    pub fn mark_attempted(&self, entry: &QueueEntry) -> Result<QueueEntry, StoreError> {
        self.mark_attempted_at(entry, now_unix_ms())
    }

    pub fn mark_attempted_at(
        &self,
        entry: &QueueEntry,
        now_ms: i64,
    ) -> Result<QueueEntry, StoreError> {
        let updated = QueueEntry {
            attempt_count: entry.attempt_count.saturating_add(1),
            next_attempt_ms: now_ms.saturating_add(self.backoff_delay_ms()),
            ..entry.clone()
        };
        self.db.upsert_queue_entry(&updated)?;
        debug!(
            "Rescrape attempt {} recorded for scene:{}",
            updated.attempt_count, updated.record_id
        );
        Ok(updated)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.db.get_queue_entries()
    }

    pub fn due_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.due_entries_at(now_unix_ms())
    }

    pub fn due_entries_at(&self, now_ms: i64) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self
            .db
            .get_queue_entries()?
            .into_iter()
            .filter(|entry| entry.is_due_at(now_ms))
            .collect())
    }

    pub fn remove(&self, record_id: &str) -> Result<bool, StoreError> {
        self.db.delete_queue_entry(record_id)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        self.db.clear_queue()
    }
}
