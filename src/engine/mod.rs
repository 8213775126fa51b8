//! Automation engine: runs one enrichment session per scene.
//!
//! Flow: detect -> open editor -> scrape each pending provider in routed
//! order (create linked entities, apply) -> save -> organize. Cancellation
//! is cooperative and checked around every step; nothing already applied is
//! rolled back. Every terminal outcome writes one history entry and one
//! summary notification, and the per-scene active marker is always released.

pub mod session;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::cancel::{run_source_step, run_step, wait_until, SessionControl};
use crate::config::{
    AutomationConfig, Config, OrganizePolicy, ProvidersConfig, QueueConfig, ScoringConfig,
};
use crate::error::{EngineError, StepError, SurfaceError};
use crate::history::{HistoryEntry, HistoryStore};
use crate::model::{Provider, Scene, ScrapeResult, ScrapedScene};
use crate::notify::Notifier;
use crate::prompt::{ApplyDecision, OperatorPrompt};
use crate::protocol::{SessionOutcome, SessionSummary};
use crate::query::{invalidate_scene, QueryClient};
use crate::rescrape_queue::RescrapeQueue;
use crate::routing::AdaptiveRouter;
use crate::scoring::score_scraped;
use crate::source_stats::SourceStatsStore;
use crate::status::StatusTracker;
use crate::surface::{ProbeTarget, SceneSurface};

pub use self::session::{ActionLogEntry, AutomationSession, EngineState};

const USER_SKIPPED: &str = "user skipped";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn step_failure(step: &str, error: StepError) -> EngineError {
    match error {
        StepError::Cancelled { .. } => EngineError::UserCancelled,
        other => EngineError::Structural {
            step: step.to_string(),
            message: other.to_string(),
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Providers to scrape even if already detected.
    pub force: Vec<Provider>,
    /// Externally owned control; a fresh one is created when absent.
    pub control: Option<SessionControl>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub session: AutomationSession,
    pub history: HistoryEntry,
    pub summary: SessionSummary,
}

/// Services the engine drives. Built once by the application context.
pub struct EngineDeps {
    pub client: Arc<QueryClient>,
    pub tracker: Arc<StatusTracker>,
    pub surface: Arc<dyn SceneSurface>,
    pub prompt: Arc<dyn OperatorPrompt>,
    pub stats: Arc<SourceStatsStore>,
    pub queue: Arc<RescrapeQueue>,
    pub history: Arc<HistoryStore>,
    pub notifier: Notifier,
}

/// Releases the per-scene active marker on every exit path.
struct ActiveSessionGuard<'a> {
    active: &'a Mutex<HashMap<String, SessionControl>>,
    scene_id: String,
}

impl Drop for ActiveSessionGuard<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.scene_id);
    }
}

pub struct AutomationEngine {
    automation: AutomationConfig,
    providers: ProvidersConfig,
    queue_config: QueueConfig,
    scoring: ScoringConfig,
    router: AdaptiveRouter,
    step_timeout: Duration,
    poll_interval: Duration,
    deps: EngineDeps,
    active: Mutex<HashMap<String, SessionControl>>,
}

impl AutomationEngine {
    pub fn new(config: &Config, deps: EngineDeps) -> Self {
        Self {
            automation: config.automation.clone(),
            providers: config.providers.clone(),
            queue_config: config.queue.clone(),
            scoring: config.scoring.clone(),
            router: AdaptiveRouter::new(config.routing.adaptive),
            step_timeout: Duration::from_millis(config.automation.step_timeout_ms.max(1)),
            poll_interval: Duration::from_millis(config.automation.poll_interval_ms.max(1)),
            deps,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_active(&self, scene_id: &str) -> bool {
        lock(&self.active).contains_key(scene_id)
    }

    /// Control handle of the running session for `scene_id`, if any.
    pub fn control_for(&self, scene_id: &str) -> Option<SessionControl> {
        lock(&self.active).get(scene_id).cloned()
    }

    fn begin(&self, scene_id: &str, control: SessionControl) -> Result<ActiveSessionGuard<'_>, EngineError> {
        let mut active = lock(&self.active);
        if active.contains_key(scene_id) {
            warn!(
                "Automation[scene:{}]: refusing to start, a session is already active",
                scene_id
            );
            return Err(EngineError::SessionConflict {
                scene_id: scene_id.to_string(),
            });
        }
        active.insert(scene_id.to_string(), control);
        Ok(ActiveSessionGuard {
            active: &self.active,
            scene_id: scene_id.to_string(),
        })
    }

    /// Runs one session. Only a session conflict is returned as an error;
    /// every other outcome, including cancellation and failure, is reported.
    pub async fn run(&self, scene_id: &str, options: RunOptions) -> Result<SessionReport, EngineError> {
        let control = options.control.clone().unwrap_or_default();
        let _guard = self.begin(scene_id, control.clone())?;
        let mut session = AutomationSession::new(scene_id);
        let outcome = match self.drive(&mut session, &control, &options.force).await {
            Ok(()) => SessionOutcome::Completed,
            Err(EngineError::UserCancelled) => {
                session.warn("automation cancelled by user");
                SessionOutcome::Cancelled
            }
            Err(err) => {
                session.error(err.to_string());
                SessionOutcome::Failed
            }
        };
        Ok(self.finalize(session, outcome))
    }

    fn finalize(&self, mut session: AutomationSession, outcome: SessionOutcome) -> SessionReport {
        session.finish(outcome);
        self.deps
            .notifier
            .state_changed(&session.scene_id, session.state);
        let entry = session.to_history_entry();
        let history = match self.deps.history.record(entry.clone()) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(
                    "Automation[scene:{}]: failed to write history entry: {}",
                    session.scene_id, err
                );
                entry
            }
        };
        let summary = session.summary(outcome);
        self.deps.notifier.session_finished(summary.clone());
        SessionReport {
            outcome,
            session,
            history,
            summary,
        }
    }

    fn transition(&self, session: &mut AutomationSession, state: EngineState) {
        session.enter(state);
        self.deps.notifier.state_changed(&session.scene_id, state);
    }

    fn checkpoint(&self, control: &SessionControl, step: &str) -> Result<(), EngineError> {
        control
            .checkpoint(step)
            .map_err(|_| EngineError::UserCancelled)
    }

    async fn step<T, F>(&self, control: &SessionControl, step: &str, future: F) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, SurfaceError>>,
    {
        run_step(control, step, self.step_timeout, self.poll_interval, future).await
    }

    /// A step that belongs to one source: a skip request ends it.
    async fn source_step<T, F>(
        &self,
        control: &SessionControl,
        step: &str,
        future: F,
    ) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, SurfaceError>>,
    {
        run_source_step(control, step, self.step_timeout, self.poll_interval, future).await
    }

    fn enqueue(&self, session: &mut AutomationSession, reason: String) {
        if let Err(err) = self.deps.queue.enqueue(&session.scene_id, &reason) {
            session.warn(format!("could not queue rescrape: {err}"));
        }
    }

    fn organize_allowed(&self, satisfied: &[Provider], force: &[Provider]) -> bool {
        let configured: Vec<Provider> = Provider::ALL
            .into_iter()
            .filter(|provider| self.providers.get(*provider).auto_scrape || force.contains(provider))
            .collect();
        if configured.is_empty() {
            return false;
        }
        match self.automation.organize_policy {
            OrganizePolicy::All => configured.iter().all(|provider| satisfied.contains(provider)),
            OrganizePolicy::Any => configured.iter().any(|provider| satisfied.contains(provider)),
        }
    }

    async fn drive(
        &self,
        session: &mut AutomationSession,
        control: &SessionControl,
        force: &[Provider],
    ) -> Result<(), EngineError> {
        let scene_id = session.scene_id.clone();

        self.transition(session, EngineState::Detecting);
        let snapshot = self.deps.tracker.refresh(&scene_id).await?;
        session.scene_title = snapshot.scene.title.clone();
        self.deps.notifier.status_updated(snapshot.clone());
        session.log(format!(
            "detected {}% complete",
            snapshot.percentage
        ));
        self.checkpoint(control, "detect")?;

        self.step(control, "open editor", self.deps.surface.open_editor(&scene_id))
            .await
            .map_err(|err| step_failure("open editor", err))?;

        match self.deps.queue.due_entry(&scene_id) {
            Ok(Some(entry)) => {
                session.log(format!(
                    "revisiting queued scene (attempt {}, reason: {})",
                    entry.attempt_count + 1,
                    entry.reason
                ));
                if let Err(err) = self.deps.queue.mark_attempted(&entry) {
                    session.warn(format!("could not update rescrape queue: {err}"));
                }
            }
            Ok(None) => {}
            Err(err) => session.warn(format!("rescrape queue unavailable: {err}")),
        }

        let mut satisfied = Vec::new();
        let mut pending = Vec::new();
        for provider in Provider::ALL {
            let forced = force.contains(&provider);
            let enabled = self.providers.get(provider).auto_scrape;
            let detected = snapshot
                .status_for(provider)
                .filter(|status| status.found)
                .cloned();
            if detected.is_some() && (enabled || forced) {
                satisfied.push(provider);
            }
            if forced {
                session.log(format!("{provider}: forced re-scrape"));
                pending.push(provider);
                continue;
            }
            if !enabled {
                continue;
            }
            match detected {
                Some(status) if self.automation.skip_already_scraped => session.log(format!(
                    "{provider} already scraped ({} {}%), skipping",
                    status.strategy_name, status.confidence
                )),
                _ => pending.push(provider),
            }
        }

        let stats = self.deps.stats.get_all().unwrap_or_else(|err| {
            warn!("Automation[scene:{}]: source stats unavailable: {}", scene_id, err);
            HashMap::new()
        });
        let ordered = self.router.order(&pending, &stats);
        if ordered != pending {
            session.log(format!(
                "adaptive routing order: {}",
                ordered
                    .iter()
                    .map(|provider| provider.display_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let mut applied = Vec::new();
        for provider in ordered.iter().copied() {
            self.checkpoint(control, "next source")?;
            if control.take_skip() {
                session.skip(provider, USER_SKIPPED);
                continue;
            }
            match self
                .process_source(session, control, &snapshot.scene, provider)
                .await
            {
                Ok(true) => applied.push(provider),
                Ok(false) => {}
                Err(EngineError::UserSkipped(skipped)) => session.skip(skipped, USER_SKIPPED),
                Err(err) => return Err(err),
            }
            if control.take_skip() {
                debug!(
                    "Automation[scene:{}]: skip request arrived after {} finished, dropped",
                    scene_id, provider
                );
            }
            self.checkpoint(control, "source finished")?;
        }

        // Save only follows an apply; with nothing applied there is no
        // pending edit to persist.
        if applied.is_empty() {
            session.log("nothing applied, save not needed");
        } else {
            self.transition(session, EngineState::Saving);
            self.step(control, "save", self.deps.surface.save(&scene_id))
                .await
                .map_err(|err| step_failure("save", err))?;
            invalidate_scene(&self.deps.client, &scene_id);
            session.log("scene saved");
        }
        self.checkpoint(control, "organize")?;

        for provider in &applied {
            if !satisfied.contains(provider) {
                satisfied.push(*provider);
            }
        }
        if !self.automation.auto_organize {
            session.log("auto-organize disabled");
        } else if snapshot.organized.found {
            session.log("scene already organized");
        } else if !self.organize_allowed(&satisfied, force) {
            session.log(format!(
                "not organizing: {:?} policy not satisfied",
                self.automation.organize_policy
            ));
        } else {
            self.organize(session, control).await?;
        }

        if pending.iter().all(|provider| applied.contains(provider)) {
            match self.deps.queue.remove(&scene_id) {
                Ok(true) => session.log("removed from rescrape queue"),
                Ok(false) => {}
                Err(err) => session.warn(format!("could not update rescrape queue: {err}")),
            }
        }
        Ok(())
    }

    /// Returns whether the provider's data was applied.
    async fn process_source(
        &self,
        session: &mut AutomationSession,
        control: &SessionControl,
        scene: &Scene,
        provider: Provider,
    ) -> Result<bool, EngineError> {
        let scene_id = scene.id.as_str();
        self.transition(session, EngineState::Scraping(provider));
        let scrape_step = format!("scrape {provider}");
        let scraped = match self
            .source_step(control, &scrape_step, self.deps.surface.scrape(scene_id, provider))
            .await
        {
            Ok(ScrapeResult::Matched(scraped)) => {
                self.deps.stats.record_attempt_logged(provider, true);
                scraped
            }
            Ok(ScrapeResult::NoMatch) => {
                self.deps.stats.record_attempt_logged(provider, false);
                session.skip(provider, "no match");
                self.enqueue(session, format!("no match from {provider}"));
                return Ok(false);
            }
            Err(StepError::Cancelled { .. }) => return Err(EngineError::UserCancelled),
            Err(StepError::Skipped { .. }) => return Err(EngineError::UserSkipped(provider)),
            Err(err) if err.is_timeout() => {
                self.deps.stats.record_attempt_logged(provider, false);
                session.skip(provider, format!("timeout: {err}"));
                self.enqueue(session, format!("{provider} scrape timeout"));
                return Ok(false);
            }
            Err(err) => {
                self.deps.stats.record_attempt_logged(provider, false);
                session.skip(provider, format!("scrape failed: {err}"));
                self.enqueue(session, format!("{provider} scrape failed"));
                return Ok(false);
            }
        };
        if control.take_skip() {
            return Err(EngineError::UserSkipped(provider));
        }

        let score = score_scraped(&scraped, &self.scoring);
        session.log(format!("{provider} matched (score {score})"));
        if self.automation.auto_apply && score < self.automation.min_auto_apply_score {
            session.skip(
                provider,
                format!(
                    "score {score} below minimum {}",
                    self.automation.min_auto_apply_score
                ),
            );
            if self.queue_config.enqueue_on_low_score {
                self.enqueue(session, format!("low score from {provider}"));
            }
            return Ok(false);
        }

        let scraped = self
            .create_linked_entities(session, control, scene_id, provider, scraped)
            .await?;
        self.checkpoint(control, "apply")?;
        if control.take_skip() {
            return Err(EngineError::UserSkipped(provider));
        }

        self.transition(session, EngineState::Applying(provider));
        if !self.automation.auto_apply {
            let decision = tokio::select! {
                decision = self.deps.prompt.decide(scene, provider, &scraped, score) => decision,
                _ = control.cancelled(self.poll_interval) => ApplyDecision::Cancel,
                _ = control.skip_requested(self.poll_interval) => {
                    control.take_skip();
                    return Err(EngineError::UserSkipped(provider));
                }
            };
            match decision {
                ApplyDecision::Apply => {}
                ApplyDecision::Skip => {
                    session.skip(provider, "operator skipped");
                    return Ok(false);
                }
                ApplyDecision::Cancel => return Err(EngineError::UserCancelled),
            }
        }

        let apply_step = format!("apply {provider}");
        match self
            .source_step(
                control,
                &apply_step,
                self.deps.surface.apply(scene_id, provider, &scraped),
            )
            .await
        {
            Ok(fields) => {
                session.log(format!("{provider}: applied {} fields", fields.len()));
                session.record_applied(provider, fields);
                Ok(true)
            }
            Err(StepError::Cancelled { .. }) => Err(EngineError::UserCancelled),
            Err(StepError::Skipped { .. }) => Err(EngineError::UserSkipped(provider)),
            Err(err) => {
                session.skip(provider, format!("apply failed: {err}"));
                Ok(false)
            }
        }
    }

    async fn create_linked_entities(
        &self,
        session: &mut AutomationSession,
        control: &SessionControl,
        scene_id: &str,
        provider: Provider,
        scraped: ScrapedScene,
    ) -> Result<ScrapedScene, EngineError> {
        let missing = scraped.missing_entities();
        if !self.automation.create_linked_entities || missing == 0 {
            return Ok(scraped);
        }
        self.transition(session, EngineState::CreatingLinkedEntities(provider));
        match self
            .source_step(
                control,
                "create linked entities",
                self.deps.surface.create_linked_entities(scene_id, &scraped),
            )
            .await
        {
            Ok(updated) => {
                session.log(format!(
                    "created {} linked entities",
                    missing.saturating_sub(updated.missing_entities())
                ));
                Ok(updated)
            }
            Err(StepError::Cancelled { .. }) => Err(EngineError::UserCancelled),
            Err(StepError::Skipped { .. }) => Err(EngineError::UserSkipped(provider)),
            Err(err) => {
                session.warn(format!("linked entity creation failed: {err}"));
                Ok(scraped)
            }
        }
    }

    async fn organize(
        &self,
        session: &mut AutomationSession,
        control: &SessionControl,
    ) -> Result<(), EngineError> {
        let scene_id = session.scene_id.clone();
        self.transition(session, EngineState::Organizing);
        match self
            .step(control, "mark organized", self.deps.surface.mark_organized(&scene_id))
            .await
        {
            Ok(()) => {}
            Err(StepError::Cancelled { .. }) => return Err(EngineError::UserCancelled),
            Err(err) => {
                session.warn(format!("could not mark scene organized: {err}"));
                return Ok(());
            }
        }

        let surface = self.deps.surface.clone();
        let confirmed = wait_until(
            control,
            "organized confirmation",
            self.step_timeout,
            self.poll_interval,
            || {
                let surface = surface.clone();
                let scene_id = scene_id.clone();
                async move {
                    Ok(surface
                        .probe(&scene_id, ProbeTarget::OrganizedToggle)
                        .await?
                        .is_some())
                }
            },
        )
        .await;
        invalidate_scene(&self.deps.client, &scene_id);
        match confirmed {
            Ok(()) => {
                session.log("scene marked organized");
                Ok(())
            }
            Err(StepError::Cancelled { .. }) => Err(EngineError::UserCancelled),
            Err(err) => {
                session.warn(format!("organized state not confirmed: {err}"));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EngineState, RunOptions};
    use crate::cancel::SessionControl;
    use crate::config::{Config, OrganizePolicy};
    use crate::error::{EngineError, SurfaceError};
    use crate::model::{now_unix_ms, Provider, ScrapedScene};
    use crate::prompt::ApplyDecision;
    use crate::protocol::{AutomationEvent, SessionOutcome};
    use crate::test_support::{
        full_match, harness, harness_with_prompt, scene_json, HangingPrompt, ScrapeScript,
        ScriptedPrompt, STASHDB_ENDPOINT,
    };

    fn with_control(control: &SessionControl) -> RunOptions {
        RunOptions {
            force: Vec::new(),
            control: Some(control.clone()),
        }
    }

    async fn signal_after(delay_ms: u64, signal: impl FnOnce()) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        signal();
    }

    fn both_match(harness: &crate::test_support::Harness) {
        harness
            .surface
            .set_scrape(Provider::StashDb, ScrapeScript::Match(full_match("A")));
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Match(full_match("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_both_providers_complete_and_organize() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("1", &[]));
        both_match(&harness);
        let mut events = harness.context.notifier.subscribe();

        let report = harness
            .context
            .engine
            .run("1", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(report.history.success);
        assert_eq!(
            report.history.sources_used,
            vec![Provider::StashDb, Provider::ThePornDb]
        );
        assert!(harness.surface.was_called("save"));
        assert!(harness.surface.is_organized());
        assert!(report.session.visited(EngineState::Organizing));
        assert_eq!(harness.context.history.entries().expect("history").len(), 1);
        assert!(harness.context.queue.entries().expect("queue").is_empty());
        assert_eq!(
            harness
                .context
                .stats
                .get(Provider::StashDb)
                .expect("stats")
                .success_count,
            1
        );
        assert!(!harness.context.engine.is_active("1"));

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AutomationEvent::SessionFinished(_)) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_scraped_provider_is_never_invoked() {
        let harness = harness(Config::default());
        harness
            .transport
            .insert_scene(scene_json("2", &[STASHDB_ENDPOINT]));
        both_match(&harness);

        let report = harness
            .context
            .engine
            .run("2", RunOptions::default())
            .await
            .expect("session should run");

        assert!(!harness.surface.was_called("scrape:stashdb"));
        assert!(harness.surface.was_called("scrape:theporndb"));
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
        assert!(harness.surface.is_organized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_provider_bypasses_detection() {
        let harness = harness(Config::default());
        harness
            .transport
            .insert_scene(scene_json("2", &[STASHDB_ENDPOINT]));
        both_match(&harness);

        let report = harness
            .context
            .engine
            .run(
                "2",
                RunOptions {
                    force: vec![Provider::StashDb],
                    control: None,
                },
            )
            .await
            .expect("session should run");

        assert!(harness.surface.was_called("scrape:stashdb"));
        assert_eq!(
            report.history.sources_used,
            vec![Provider::StashDb, Provider::ThePornDb]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scrape_timeout_skips_provider_and_continues() {
        let mut config = Config::default();
        config.automation.step_timeout_ms = 1_000;
        let harness = harness(config);
        harness.transport.insert_scene(scene_json("3", &[]));
        harness
            .surface
            .set_scrape(Provider::StashDb, ScrapeScript::Hang);
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Match(full_match("B")));

        let report = harness
            .context
            .engine
            .run("3", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        let skipped = &report.history.skipped_sources;
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].provider, Provider::StashDb);
        assert!(skipped[0].reason.contains("timeout"));
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
        let stats = harness
            .context
            .stats
            .get(Provider::StashDb)
            .expect("stats");
        assert_eq!(stats.fail_count, 1);
        assert_eq!(stats.success_count, 0);
        assert_eq!(harness.context.queue.entries().expect("queue").len(), 1);
        // All-providers policy: the timed-out source blocks organizing.
        assert!(!harness.surface.was_called("mark_organized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_policy_organizes_after_partial_success() {
        let mut config = Config::default();
        config.automation.organize_policy = OrganizePolicy::Any;
        let harness = harness(config);
        harness.transport.insert_scene(scene_json("3", &[]));
        harness
            .surface
            .set_scrape(Provider::StashDb, ScrapeScript::NoMatch);
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Match(full_match("B")));

        let report = harness
            .context
            .engine
            .run("3", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.history.skipped_sources[0].reason, "no match");
        assert!(harness.surface.is_organized());
        let queued = harness.context.queue.entries().expect("queue");
        assert_eq!(queued[0].reason, "no match from StashDB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_sources_stops_before_save() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("4", &[]));
        both_match(&harness);
        let control = SessionControl::new();
        harness
            .surface
            .cancel_after_apply(Provider::StashDb, control.clone());

        let report = harness
            .context
            .engine
            .run(
                "4",
                RunOptions {
                    force: Vec::new(),
                    control: Some(control),
                },
            )
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        assert!(!report.history.success);
        assert!(report.history.cancelled);
        assert_eq!(report.history.sources_used, vec![Provider::StashDb]);
        assert!(!harness.surface.was_called("scrape:theporndb"));
        assert!(!harness.surface.was_called("save"));
        assert!(!harness.surface.was_called("mark_organized"));
        assert!(!report.session.visited(EngineState::Saving));
        assert!(!report.session.visited(EngineState::Organizing));
        assert!(!harness.context.engine.is_active("4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_for_same_scene_is_refused() {
        let mut config = Config::default();
        config.automation.step_timeout_ms = 500;
        let harness = harness(config);
        harness.transport.insert_scene(scene_json("5", &[]));
        harness
            .surface
            .set_scrape(Provider::StashDb, ScrapeScript::Hang);
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Hang);
        let engine = &harness.context.engine;

        let (first, second) = tokio::join!(engine.run("5", RunOptions::default()), async {
            tokio::task::yield_now().await;
            assert!(engine.control_for("5").is_some());
            engine.run("5", RunOptions::default()).await
        });

        assert!(matches!(
            second,
            Err(EngineError::SessionConflict { ref scene_id }) if scene_id == "5"
        ));
        assert!(first.is_ok());
        assert!(!engine.is_active("5"));
        assert_eq!(harness.context.history.entries().expect("history").len(), 1);

        // Re-enterable after the first session finished.
        assert!(engine.run("5", RunOptions::default()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_editor_failure_fails_session_and_releases_marker() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("6", &[]));
        harness.surface.fail_open_editor();

        let report = harness
            .context
            .engine
            .run("6", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Failed);
        assert!(!report.history.success);
        assert!(report.history.errors[0].contains("open editor"));
        assert!(!harness.surface.was_called("scrape:stashdb"));
        assert!(!harness.context.engine.is_active("6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_is_structural() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("7", &[]));
        both_match(&harness);
        harness.surface.fail_save();

        let report = harness
            .context
            .engine
            .run("7", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Failed);
        assert!(!harness.surface.was_called("mark_organized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_scene_fails_session() {
        let harness = harness(Config::default());
        let report = harness
            .context
            .engine
            .run("404", RunOptions::default())
            .await
            .expect("session should run");
        assert_eq!(report.outcome, SessionOutcome::Failed);
        assert!(!harness.surface.was_called("open_editor"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_skip_signal_skips_current_source_only() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("8", &[]));
        both_match(&harness);
        let control = SessionControl::new();
        control.skip_current_source();

        let report = harness
            .context
            .engine
            .run(
                "8",
                RunOptions {
                    force: Vec::new(),
                    control: Some(control),
                },
            )
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.history.skipped_sources[0].provider, Provider::StashDb);
        assert_eq!(report.history.skipped_sources[0].reason, "user skipped");
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_during_hung_scrape_moves_to_next_source() {
        let mut config = Config::default();
        config.automation.step_timeout_ms = 1_000;
        let harness = harness(config);
        harness.transport.insert_scene(scene_json("20", &[]));
        harness
            .surface
            .set_scrape(Provider::StashDb, ScrapeScript::Hang);
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Match(full_match("B")));
        let control = SessionControl::new();

        let (report, ()) = tokio::join!(
            harness.context.engine.run("20", with_control(&control)),
            signal_after(100, || control.skip_current_source()),
        );
        let report = report.expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        let skipped = &report.history.skipped_sources;
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].provider, Provider::StashDb);
        assert_eq!(skipped[0].reason, "user skipped");
        assert!(harness.surface.was_called("scrape:theporndb"));
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
        // A user skip is neither a provider failure nor a reason to rescrape.
        assert_eq!(
            harness
                .context
                .stats
                .get(Provider::StashDb)
                .expect("stats")
                .fail_count,
            0
        );
        assert!(harness.context.queue.entries().expect("queue").is_empty());
        assert!(!control.take_skip());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_during_apply_skips_only_that_source() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("21", &[]));
        both_match(&harness);
        harness.surface.hang_apply(Provider::StashDb);
        let control = SessionControl::new();

        let (report, ()) = tokio::join!(
            harness.context.engine.run("21", with_control(&control)),
            signal_after(100, || control.skip_current_source()),
        );
        let report = report.expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(harness.surface.was_called("apply:stashdb"));
        assert!(harness.surface.was_called("apply:theporndb"));
        assert_eq!(report.history.skipped_sources.len(), 1);
        assert_eq!(report.history.skipped_sources[0].provider, Provider::StashDb);
        assert_eq!(report.history.skipped_sources[0].reason, "user skipped");
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
        assert!(harness.surface.was_called("save"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_operator_prompt_is_pending() {
        let mut config = Config::default();
        config.automation.auto_apply = false;
        let harness = harness_with_prompt(config, HangingPrompt::new(Provider::StashDb));
        harness.transport.insert_scene(scene_json("22", &[]));
        both_match(&harness);
        let control = SessionControl::new();

        let (report, ()) = tokio::join!(
            harness.context.engine.run("22", with_control(&control)),
            signal_after(100, || control.cancel()),
        );
        let report = report.expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        assert!(report.history.cancelled);
        assert!(report.session.visited(EngineState::Applying(Provider::StashDb)));
        assert!(!harness.surface.was_called("apply:stashdb"));
        assert!(!harness.surface.was_called("scrape:theporndb"));
        assert!(!harness.surface.was_called("save"));
        assert!(!harness.context.engine.is_active("22"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_while_operator_prompt_is_pending() {
        let mut config = Config::default();
        config.automation.auto_apply = false;
        let harness = harness_with_prompt(config, HangingPrompt::new(Provider::StashDb));
        harness.transport.insert_scene(scene_json("23", &[]));
        both_match(&harness);
        let control = SessionControl::new();

        let (report, ()) = tokio::join!(
            harness.context.engine.run("23", with_control(&control)),
            signal_after(100, || control.skip_current_source()),
        );
        let report = report.expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.history.skipped_sources[0].provider, Provider::StashDb);
        assert_eq!(report.history.skipped_sources[0].reason, "user skipped");
        assert!(!harness.surface.was_called("apply:stashdb"));
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_score_is_skipped_and_queued() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("9", &[]));
        harness.surface.set_scrape(
            Provider::StashDb,
            ScrapeScript::Match(ScrapedScene {
                title: Some("Only a title".to_string()),
                ..ScrapedScene::default()
            }),
        );
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::NoMatch);

        let report = harness
            .context
            .engine
            .run("9", RunOptions::default())
            .await
            .expect("session should run");

        assert!(report.history.sources_used.is_empty());
        assert!(report.history.skipped_sources[0]
            .reason
            .contains("below minimum"));
        assert!(!harness.surface.was_called("apply:stashdb"));
        assert!(!harness.surface.was_called("save"));
        // A matched scrape still counts as a provider success.
        assert_eq!(
            harness
                .context
                .stats
                .get(Provider::StashDb)
                .expect("stats")
                .success_count,
            1
        );
        assert_eq!(harness.context.queue.entries().expect("queue").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_decisions_skip_and_cancel() {
        let mut config = Config::default();
        config.automation.auto_apply = false;
        let prompt = ScriptedPrompt::new(vec![
            (Provider::StashDb, ApplyDecision::Skip),
            (Provider::ThePornDb, ApplyDecision::Apply),
        ]);
        let harness = harness_with_prompt(config.clone(), prompt);
        harness.transport.insert_scene(scene_json("10", &[]));
        both_match(&harness);

        let report = harness
            .context
            .engine
            .run("10", RunOptions::default())
            .await
            .expect("session should run");
        assert_eq!(report.history.sources_used, vec![Provider::ThePornDb]);
        assert_eq!(report.history.skipped_sources[0].reason, "operator skipped");

        let cancelling = harness_with_prompt(
            config,
            ScriptedPrompt::new(vec![(Provider::StashDb, ApplyDecision::Cancel)]),
        );
        cancelling.transport.insert_scene(scene_json("11", &[]));
        both_match(&cancelling);
        let cancelled = cancelling
            .context
            .engine
            .run("11", RunOptions::default())
            .await
            .expect("session should run");
        assert_eq!(cancelled.outcome, SessionOutcome::Cancelled);
        assert!(!cancelling.surface.was_called("apply:stashdb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_routing_tries_stronger_provider_first() {
        let mut config = Config::default();
        config.routing.adaptive = true;
        let harness = harness(config);
        harness.transport.insert_scene(scene_json("12", &[]));
        both_match(&harness);
        for _ in 0..3 {
            harness
                .context
                .stats
                .record_attempt(Provider::StashDb, false)
                .expect("stats");
        }

        harness
            .context
            .engine
            .run("12", RunOptions::default())
            .await
            .expect("session should run");

        let scrapes: Vec<String> = harness
            .surface
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("scrape:"))
            .collect();
        assert_eq!(scrapes, vec!["scrape:theporndb", "scrape:stashdb"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_queue_entry_is_consumed_and_removed_on_success() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("13", &[]));
        both_match(&harness);
        harness
            .context
            .queue
            .enqueue_at("13", "no match from StashDB", now_unix_ms() - 10 * 60 * 60 * 1000)
            .expect("enqueue");

        let report = harness
            .context
            .engine
            .run("13", RunOptions::default())
            .await
            .expect("session should run");

        assert!(report
            .session
            .actions
            .iter()
            .any(|action| action.message.contains("revisiting queued scene")));
        assert!(harness.context.queue.entries().expect("queue").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_entities_are_created_before_apply() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("14", &[]));
        both_match(&harness);

        let report = harness
            .context
            .engine
            .run("14", RunOptions::default())
            .await
            .expect("session should run");

        assert!(report
            .session
            .visited(EngineState::CreatingLinkedEntities(Provider::StashDb)));
        let calls = harness.surface.calls();
        let created = calls
            .iter()
            .position(|call| call == "create_linked:stashdb")
            .expect("linked entities created");
        let applied = calls
            .iter()
            .position(|call| call == "apply:stashdb")
            .expect("applied");
        assert!(created < applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scrape_error_skips_provider_with_reason() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("16", &[]));
        harness.surface.set_scrape(
            Provider::StashDb,
            ScrapeScript::Fail(SurfaceError::Unavailable("scraper offline".to_string())),
        );
        harness
            .surface
            .set_scrape(Provider::ThePornDb, ScrapeScript::Match(full_match("B")));

        let report = harness
            .context
            .engine
            .run("16", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        let skipped = &report.history.skipped_sources[0];
        assert_eq!(skipped.provider, Provider::StashDb);
        assert!(skipped.reason.starts_with("scrape failed"));
        assert!(skipped.reason.contains("scraper offline"));
        assert_eq!(harness.context.queue.entries().expect("queue").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_organize_failure_is_only_a_warning() {
        let harness = harness(Config::default());
        harness.transport.insert_scene(scene_json("15", &[]));
        both_match(&harness);
        harness
            .surface
            .fail_mark_organized(SurfaceError::NotFound("organized toggle".to_string()));

        let report = harness
            .context
            .engine
            .run("15", RunOptions::default())
            .await
            .expect("session should run");

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(report
            .session
            .warnings
            .iter()
            .any(|warning| warning.contains("could not mark scene organized")));
    }
}
