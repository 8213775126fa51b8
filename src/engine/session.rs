//! Mutable state of one automation run.

use std::fmt;

use log::{info, warn};

use crate::history::{HistoryEntry, SkippedSource};
use crate::model::{now_unix_ms, Provider};
use crate::protocol::{SessionOutcome, SessionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum EngineState {
    Idle,
    Detecting,
    Scraping(Provider),
    CreatingLinkedEntities(Provider),
    Applying(Provider),
    Saving,
    Organizing,
    Completed,
    Cancelled,
    Failed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Detecting => f.write_str("detecting"),
            Self::Scraping(provider) => write!(f, "scraping {provider}"),
            Self::CreatingLinkedEntities(provider) => {
                write!(f, "creating linked entities for {provider}")
            }
            Self::Applying(provider) => write!(f, "applying {provider}"),
            Self::Saving => f.write_str("saving"),
            Self::Organizing => f.write_str("organizing"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLogEntry {
    pub timestamp_ms: i64,
    pub state: EngineState,
    pub message: String,
}

/// Owned exclusively by one engine run; finalized into a [`HistoryEntry`].
#[derive(Debug, Clone)]
pub struct AutomationSession {
    pub scene_id: String,
    pub scene_title: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub state: EngineState,
    pub states_visited: Vec<EngineState>,
    pub actions: Vec<ActionLogEntry>,
    pub sources_used: Vec<Provider>,
    pub skipped: Vec<SkippedSource>,
    pub fields_updated: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
    pub success: bool,
}

impl AutomationSession {
    pub fn new(scene_id: &str) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            scene_title: String::new(),
            started_ms: now_unix_ms(),
            ended_ms: None,
            state: EngineState::Idle,
            states_visited: vec![EngineState::Idle],
            actions: Vec::new(),
            sources_used: Vec::new(),
            skipped: Vec::new(),
            fields_updated: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            success: false,
        }
    }

    pub fn enter(&mut self, state: EngineState) {
        self.state = state;
        self.states_visited.push(state);
    }

    pub fn visited(&self, state: EngineState) -> bool {
        self.states_visited.contains(&state)
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("Automation[scene:{}]: {}", self.scene_id, message);
        self.actions.push(ActionLogEntry {
            timestamp_ms: now_unix_ms(),
            state: self.state,
            message,
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Automation[scene:{}]: {}", self.scene_id, message);
        self.actions.push(ActionLogEntry {
            timestamp_ms: now_unix_ms(),
            state: self.state,
            message: message.clone(),
        });
        self.warnings.push(message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Automation[scene:{}]: error: {}", self.scene_id, message);
        self.actions.push(ActionLogEntry {
            timestamp_ms: now_unix_ms(),
            state: self.state,
            message: message.clone(),
        });
        self.errors.push(message);
    }

    /// Records `provider` as skipped for the rest of the session.
    pub fn skip(&mut self, provider: Provider, reason: impl Into<String>) {
        let reason = reason.into();
        self.warn(format!("{provider} skipped: {reason}"));
        self.skipped.push(SkippedSource { provider, reason });
    }

    pub fn record_applied(&mut self, provider: Provider, fields: Vec<String>) {
        if !self.sources_used.contains(&provider) {
            self.sources_used.push(provider);
        }
        for field in fields {
            if !self.fields_updated.contains(&field) {
                self.fields_updated.push(field);
            }
        }
    }

    pub fn finish(&mut self, outcome: SessionOutcome) {
        let state = match outcome {
            SessionOutcome::Completed => EngineState::Completed,
            SessionOutcome::Cancelled => EngineState::Cancelled,
            SessionOutcome::Failed => EngineState::Failed,
        };
        self.enter(state);
        self.ended_ms = Some(now_unix_ms());
        self.cancelled = outcome == SessionOutcome::Cancelled;
        self.success = outcome == SessionOutcome::Completed;
    }

    pub fn duration_ms(&self) -> i64 {
        self.ended_ms
            .unwrap_or_else(now_unix_ms)
            .saturating_sub(self.started_ms)
            .max(0)
    }

    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: self.scene_id.clone(),
            record_title: self.scene_title.clone(),
            timestamp: self.ended_ms.unwrap_or_else(now_unix_ms),
            duration_ms: self.duration_ms(),
            success: self.success,
            cancelled: self.cancelled,
            sources_used: self.sources_used.clone(),
            skipped_sources: self.skipped.clone(),
            fields_updated: self.fields_updated.len(),
            warnings_count: self.warnings.len(),
            errors: self.errors.clone(),
        }
    }

    pub fn summary(&self, outcome: SessionOutcome) -> SessionSummary {
        SessionSummary {
            scene_id: self.scene_id.clone(),
            scene_title: self.scene_title.clone(),
            outcome,
            duration_ms: self.duration_ms(),
            sources_used: self.sources_used.clone(),
            skipped: self.skipped.iter().map(|skipped| skipped.provider).collect(),
            fields_updated: self.fields_updated.len(),
            warnings: self.warnings.len(),
            error: self.errors.first().cloned(),
        }
    }
}
