//! Publishes engine events and the one-per-session summary notification.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::engine::EngineState;
use crate::model::CompletionSnapshot;
use crate::protocol::{AutomationEvent, SessionOutcome, SessionSummary};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Notifier {
    enabled: bool,
    bus: broadcast::Sender<AutomationEvent>,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { enabled, bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.bus.subscribe()
    }

    fn publish(&self, event: AutomationEvent) {
        // No receivers is fine.
        let _ = self.bus.send(event);
    }

    pub fn state_changed(&self, scene_id: &str, state: EngineState) {
        debug!("Automation[scene:{}]: -> {}", scene_id, state);
        self.publish(AutomationEvent::StateChanged {
            scene_id: scene_id.to_string(),
            state,
        });
    }

    pub fn status_updated(&self, snapshot: Arc<CompletionSnapshot>) {
        self.publish(AutomationEvent::StatusUpdated(snapshot));
    }

    /// Logs the summary and, when enabled, publishes it once.
    pub fn session_finished(&self, summary: SessionSummary) {
        if summary.outcome == SessionOutcome::Failed {
            warn!("Automation: {}", summary.headline());
        } else {
            info!("Automation: {}", summary.headline());
        }
        if self.enabled {
            self.publish(AutomationEvent::SessionFinished(summary));
        }
    }
}
