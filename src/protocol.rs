//! Event-bus protocol published by the automation engine.
//!
//! Subscribers (CLI output, UI panels, tests) receive these over a
//! `tokio::sync::broadcast` channel.

use std::sync::Arc;

use crate::engine::EngineState;
use crate::model::{CompletionSnapshot, Provider};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum AutomationEvent {
    /// Engine moved to a new state for one scene.
    StateChanged { scene_id: String, state: EngineState },
    /// A detection pass produced a fresh snapshot.
    StatusUpdated(Arc<CompletionSnapshot>),
    /// Exactly one per terminal session outcome.
    SessionFinished(SessionSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl SessionOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Summary of a finished session, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub scene_id: String,
    pub scene_title: String,
    pub outcome: SessionOutcome,
    pub duration_ms: i64,
    pub sources_used: Vec<Provider>,
    pub skipped: Vec<Provider>,
    pub fields_updated: usize,
    pub warnings: usize,
    /// First error message, if the session failed.
    pub error: Option<String>,
}

impl SessionSummary {
    /// One-line human readable description.
    pub fn headline(&self) -> String {
        let sources = if self.sources_used.is_empty() {
            "no sources".to_string()
        } else {
            self.sources_used
                .iter()
                .map(|provider| provider.display_name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut line = format!(
            "scene:{} {} ({}; {} fields updated, {} warnings, {} ms)",
            self.scene_id,
            self.outcome.label(),
            sources,
            self.fields_updated,
            self.warnings,
            self.duration_ms
        );
        if let Some(error) = &self.error {
            line.push_str(": ");
            line.push_str(error);
        }
        line
    }
}
