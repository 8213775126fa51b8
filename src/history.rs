//! Size-bounded log of finished automation sessions, with statistics and
//! JSON import/export.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::config::HistoryConfig;
use crate::db_manager::DbManager;
use crate::error::StoreError;
use crate::model::Provider;

const EXPORT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn new_entry_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Provider that was skipped during a session, and why.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedSource {
    pub provider: Provider,
    pub reason: String,
}

/// Durable record of one finished session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub record_id: String,
    #[serde(default)]
    pub record_title: String,
    /// Session end, unix milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub duration_ms: i64,
    pub success: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub sources_used: Vec<Provider>,
    #[serde(default)]
    pub skipped_sources: Vec<SkippedSource>,
    #[serde(default)]
    pub fields_updated: usize,
    #[serde(default)]
    pub warnings_count: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl HistoryEntry {
    pub fn failed(&self) -> bool {
        !self.success && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatistics {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub cancelled_runs: usize,
    /// Percentage, rounded.
    pub success_rate: u8,
    pub average_duration_ms: i64,
    pub source_usage: BTreeMap<String, usize>,
    pub last_run: Option<i64>,
}

/// Export document: `{exportDate, version, statistics, history[]}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryExport {
    pub export_date: String,
    pub version: String,
    pub statistics: HistoryStatistics,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

fn truncate_error(value: &str, max_chars: usize) -> String {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= max_chars {
        return compact;
    }
    compact.chars().take(max_chars).collect::<String>() + "…"
}

fn has_required_import_fields(value: &Value) -> bool {
    let record_id_ok = value
        .get("recordId")
        .and_then(Value::as_str)
        .is_some_and(|record_id| !record_id.trim().is_empty());
    let timestamp_ok = value.get("timestamp").is_some_and(Value::is_i64);
    let success_ok = value.get("success").is_some_and(Value::is_boolean);
    record_id_ok && timestamp_ok && success_ok
}

pub fn compute_statistics(entries: &[HistoryEntry]) -> HistoryStatistics {
    if entries.is_empty() {
        return HistoryStatistics::default();
    }
    let successful_runs = entries.iter().filter(|entry| entry.success).count();
    let cancelled_runs = entries.iter().filter(|entry| entry.cancelled).count();
    let failed_runs = entries.iter().filter(|entry| entry.failed()).count();
    let total_duration: i64 = entries.iter().map(|entry| entry.duration_ms.max(0)).sum();
    let mut source_usage = BTreeMap::new();
    for provider in entries.iter().flat_map(|entry| entry.sources_used.iter()) {
        *source_usage.entry(provider.key().to_string()).or_insert(0) += 1;
    }
    HistoryStatistics {
        total_runs: entries.len(),
        successful_runs,
        failed_runs,
        cancelled_runs,
        success_rate: ((successful_runs as f64 / entries.len() as f64) * 100.0).round() as u8,
        average_duration_ms: total_duration / entries.len() as i64,
        source_usage,
        last_run: entries.iter().map(|entry| entry.timestamp).max(),
    }
}

pub struct HistoryStore {
    db: Arc<DbManager>,
    max_entries: usize,
    max_error_chars: usize,
}

impl HistoryStore {
    pub fn new(db: Arc<DbManager>, config: &HistoryConfig) -> Self {
        Self {
            db,
            max_entries: config.max_entries.max(1),
            max_error_chars: config.max_error_chars.max(16),
        }
    }

    /// Appends an entry (error strings truncated) and evicts the oldest
    /// entries beyond the cap.
    pub fn record(&self, entry: HistoryEntry) -> Result<HistoryEntry, StoreError> {
        let entry = HistoryEntry {
            errors: entry
                .errors
                .iter()
                .map(|error| truncate_error(error, self.max_error_chars))
                .collect(),
            ..entry
        };
        self.db.insert_history_entry(&entry)?;
        let evicted = self.db.trim_history(self.max_entries)?;
        if evicted > 0 {
            info!("History cap reached; evicted {} oldest entries", evicted);
        }
        Ok(entry)
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        self.db.get_history()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.entries()?.into_iter().rev().take(limit).collect())
    }

    pub fn entries_for(&self, record_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.record_id == record_id)
            .collect())
    }

    pub fn statistics(&self) -> Result<HistoryStatistics, StoreError> {
        Ok(compute_statistics(&self.entries()?))
    }

    pub fn export(&self) -> Result<HistoryExport, StoreError> {
        let history = self.entries()?;
        Ok(HistoryExport {
            export_date: chrono::Utc::now().to_rfc3339(),
            version: EXPORT_VERSION.to_string(),
            statistics: compute_statistics(&history),
            history,
        })
    }

    pub fn export_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }

    pub fn export_to_file(&self, path: &Path) -> Result<usize, StoreError> {
        let export = self.export()?;
        std::fs::write(path, serde_json::to_string_pretty(&export)?)?;
        Ok(export.history.len())
    }

    /// Merges entries from an export document (or a bare array). Entries
    /// missing `recordId`, `timestamp` or a boolean `success` are rejected;
    /// the import fails only when nothing validates.
    pub fn import_json(&self, text: &str) -> Result<ImportReport, StoreError> {
        let document: Value = serde_json::from_str(text)?;
        let candidates = match &document {
            Value::Array(items) => items.clone(),
            Value::Object(map) => match map.get("history") {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    return Err(StoreError::InvalidImport(
                        "document has no history array".to_string(),
                    ))
                }
            },
            _ => {
                return Err(StoreError::InvalidImport(
                    "expected an object or array".to_string(),
                ))
            }
        };

        let mut report = ImportReport::default();
        let mut valid = Vec::new();
        for candidate in candidates {
            if !has_required_import_fields(&candidate) {
                report.rejected += 1;
                continue;
            }
            match serde_json::from_value::<HistoryEntry>(candidate) {
                Ok(entry) => valid.push(entry),
                Err(err) => {
                    warn!("Rejected imported history entry: {}", err);
                    report.rejected += 1;
                }
            }
        }
        if valid.is_empty() {
            return Err(StoreError::InvalidImport(format!(
                "no valid history entries ({} rejected)",
                report.rejected
            )));
        }

        let mut merged = self.entries()?;
        let mut seen: HashSet<(String, i64)> = merged
            .iter()
            .map(|entry| (entry.record_id.clone(), entry.timestamp))
            .collect();
        let mut seen_ids: HashSet<String> = merged.iter().map(|entry| entry.id.clone()).collect();
        for entry in valid {
            if !seen.insert((entry.record_id.clone(), entry.timestamp)) {
                report.duplicates += 1;
                continue;
            }
            let entry = if seen_ids.insert(entry.id.clone()) {
                entry
            } else {
                HistoryEntry {
                    id: new_entry_id(),
                    ..entry
                }
            };
            let entry = HistoryEntry {
                errors: entry
                    .errors
                    .iter()
                    .map(|error| truncate_error(error, self.max_error_chars))
                    .collect(),
                ..entry
            };
            merged.push(entry);
            report.imported += 1;
        }
        merged.sort_by_key(|entry| entry.timestamp);
        let overflow = merged.len().saturating_sub(self.max_entries);
        merged.drain(..overflow);
        self.db.replace_history(&merged)?;
        info!(
            "History import merged {} entries ({} duplicates, {} rejected)",
            report.imported, report.duplicates, report.rejected
        );
        Ok(report)
    }

    pub fn import_from_file(&self, path: &Path) -> Result<ImportReport, StoreError> {
        let text = std::fs::read_to_string(path)?;
        self.import_json(&text)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        self.db.clear_history()
    }
}
