//! Per-provider rolling success/failure counters used for adaptive routing.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::db_manager::DbManager;
use crate::error::StoreError;
use crate::model::{now_unix_ms, Provider};

/// Ratio assumed for a provider with no recorded attempts.
pub const NEUTRAL_SUCCESS_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub success_count: u64,
    pub fail_count: u64,
    pub last_attempt_ms: Option<i64>,
}

impl SourceStats {
    pub fn attempts(&self) -> u64 {
        self.success_count.saturating_add(self.fail_count)
    }

    /// `success / (success + fail)`, or the neutral ratio when unseen.
    pub fn success_ratio(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return NEUTRAL_SUCCESS_RATIO;
        }
        self.success_count as f64 / attempts as f64
    }
}

/// Persisted store over the `source_stats` table.
pub struct SourceStatsStore {
    db: Arc<DbManager>,
}

impl SourceStatsStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn get_all(&self) -> Result<HashMap<Provider, SourceStats>, StoreError> {
        self.db.get_source_stats()
    }

    pub fn get(&self, provider: Provider) -> Result<SourceStats, StoreError> {
        Ok(self
            .db
            .get_source_stats()?
            .get(&provider)
            .copied()
            .unwrap_or_default())
    }

    /// Read-modify-write of one provider's counters.
    pub fn record_attempt(&self, provider: Provider, success: bool) -> Result<SourceStats, StoreError> {
        let mut stats = self.get(provider)?;
        if success {
            stats.success_count = stats.success_count.saturating_add(1);
        } else {
            stats.fail_count = stats.fail_count.saturating_add(1);
        }
        stats.last_attempt_ms = Some(now_unix_ms());
        self.db.upsert_source_stats(provider, &stats)?;
        debug!(
            "Source stats for {}: {} ok / {} failed",
            provider, stats.success_count, stats.fail_count
        );
        Ok(stats)
    }

    /// Like `record_attempt`, but a persistence failure is only logged.
    pub fn record_attempt_logged(&self, provider: Provider, success: bool) {
        if let Err(err) = self.record_attempt(provider, success) {
            warn!("Failed to persist source stats for {}: {}", provider, err);
        }
    }

    pub fn reset(&self) -> Result<usize, StoreError> {
        self.db.clear_source_stats()
    }
}
