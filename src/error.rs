//! Error taxonomy shared across the automation core.
//!
//! Each boundary owns one enum: the query API client, the detection chain,
//! the external scene surface, individual engine steps, the engine itself,
//! the persisted stores and the config file.

use crate::model::Provider;

/// Failures surfaced by the query API client.
///
/// `Clone` so a single coalesced result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("query timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("API error: {}", .0.join("; "))]
    Api(Vec<String>),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Raised by a single detection strategy. Never fatal: the chain moves on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectionError {
    #[error("detection query failed: {0}")]
    Query(#[from] QueryError),
    #[error("surface probe failed: {0}")]
    Surface(#[from] SurfaceError),
    #[error("{0}")]
    Other(String),
}

/// Failures reported by the external scene surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface element not found: {0}")]
    NotFound(String),
    #[error("surface condition timed out: {0}")]
    Timeout(String),
    #[error("surface unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Failure of one engine step (scrape, apply, save, ...).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("{step} timed out after {timeout_ms} ms")]
    Timeout { step: String, timeout_ms: u64 },
    #[error("{step} was cancelled")]
    Cancelled { step: String },
    #[error("{step} was skipped")]
    Skipped { step: String },
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

impl StepError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StepError::Timeout { .. } | StepError::Surface(SurfaceError::Timeout(_))
        )
    }
}

/// Errors returned by the automation engine to its caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("an automation session is already active for scene {scene_id}")]
    SessionConflict { scene_id: String },
    #[error("automation cancelled by user")]
    UserCancelled,
    #[error("source {0} skipped by user")]
    UserSkipped(Provider),
    #[error("structural failure during {step}: {message}")]
    Structural { step: String, message: String },
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the persisted stores (history, queue, stats).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid import: {0}")]
    InvalidImport(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Failures writing `autoscrape.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("existing config is not a TOML document: {0}")]
    Document(#[from] toml_edit::TomlError),
}
