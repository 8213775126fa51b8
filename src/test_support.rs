//! In-process fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::app_context::AppContext;
use crate::cancel::SessionControl;
use crate::config::Config;
use crate::db_manager::DbManager;
use crate::error::{QueryError, SurfaceError};
use crate::model::{Provider, Scene, ScrapeResult, ScrapedEntity, ScrapedScene};
use crate::prompt::{ApplyDecision, AutoApprove, OperatorPrompt};
use crate::query::QueryTransport;
use crate::surface::{ProbeTarget, SceneSurface};

pub const STASHDB_ENDPOINT: &str = "https://stashdb.org/graphql";
pub const THEPORNDB_ENDPOINT: &str = "https://theporndb.net/graphql";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unorganized scene with one stash id per endpoint.
pub fn scene_json(id: &str, endpoints: &[&str]) -> Value {
    let stash_ids: Vec<Value> = endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| json!({ "endpoint": endpoint, "stash_id": format!("remote-{id}-{index}") }))
        .collect();
    json!({
        "id": id,
        "title": format!("Scene {id}"),
        "organized": false,
        "urls": [],
        "details": null,
        "date": null,
        "stash_ids": stash_ids,
        "performers": [],
        "studio": null,
        "tags": [],
    })
}

/// Scrape result scoring 95 with default weights; its linked entities are
/// all new.
pub fn full_match(label: &str) -> ScrapedScene {
    let entity = |name: String| ScrapedEntity {
        name,
        stored_id: None,
        remote_site_id: None,
    };
    ScrapedScene {
        title: Some(format!("Title {label}")),
        details: Some(format!("Details {label}")),
        date: Some("2024-01-01".to_string()),
        urls: vec![format!("https://example.com/scenes/{label}")],
        image: None,
        studio: Some(entity(format!("Studio {label}"))),
        performers: vec![entity(format!("Performer {label}"))],
        tags: vec![entity(format!("Tag {label}"))],
        remote_site_id: Some(format!("remote-{label}")),
    }
}

/// Same result with every linked entity already stored.
pub fn with_stored_ids(mut scraped: ScrapedScene) -> ScrapedScene {
    let store = |entity: &mut ScrapedEntity| {
        entity.stored_id = Some(format!("stored-{}", entity.name));
    };
    if let Some(studio) = scraped.studio.as_mut() {
        store(studio);
    }
    scraped.performers.iter_mut().for_each(store);
    scraped.tags.iter_mut().for_each(store);
    scraped
}

/// Query transport answering `findScene` from an in-memory scene map and
/// any other document from canned responses.
#[derive(Default)]
pub struct FakeTransport {
    scenes: Mutex<HashMap<String, Value>>,
    responses: Mutex<Vec<(String, Value)>>,
    requests: Mutex<Vec<(String, Value)>>,
    find_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn insert_scene(&self, scene: Value) {
        let id = scene["id"].as_str().unwrap_or_default().to_string();
        lock(&self.scenes).insert(id, scene);
    }

    /// Answers any document containing `operation` with `data`.
    pub fn respond_to(&self, operation: &str, data: Value) {
        lock(&self.responses).push((operation.to_string(), data));
    }

    pub fn find_scene_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Most recent request whose document contains `operation`.
    pub fn last_request(&self, operation: &str) -> Option<(String, Value)> {
        lock(&self.requests)
            .iter()
            .rev()
            .find(|(document, _)| document.contains(operation))
            .cloned()
    }
}

#[async_trait]
impl QueryTransport for FakeTransport {
    async fn execute(&self, document: &str, variables: Value) -> Result<Value, QueryError> {
        lock(&self.requests).push((document.to_string(), variables.clone()));
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if document.contains("findScene") {
            self.find_calls.fetch_add(1, Ordering::SeqCst);
            let id = variables["id"].as_str().unwrap_or_default();
            let scene = lock(&self.scenes).get(id).cloned().unwrap_or(Value::Null);
            return Ok(json!({ "findScene": scene }));
        }
        let canned = lock(&self.responses)
            .iter()
            .find(|(operation, _)| document.contains(operation.as_str()))
            .map(|(_, data)| data.clone());
        Ok(canned.unwrap_or_else(|| json!({})))
    }
}

#[derive(Debug, Clone)]
pub enum ScrapeScript {
    Match(ScrapedScene),
    NoMatch,
    Hang,
    Fail(SurfaceError),
}

/// Scriptable surface that records every call by name.
#[derive(Default)]
pub struct FakeSurface {
    scrapes: Mutex<HashMap<Provider, ScrapeScript>>,
    probes: Mutex<HashMap<ProbeTarget, Value>>,
    calls: Mutex<Vec<String>>,
    cancel_after_apply: Mutex<Option<(Provider, SessionControl)>>,
    hang_apply: Mutex<Option<Provider>>,
    fail_open_editor: AtomicBool,
    fail_save: AtomicBool,
    fail_mark_organized: Mutex<Option<SurfaceError>>,
}

impl FakeSurface {
    pub fn set_scrape(&self, provider: Provider, script: ScrapeScript) {
        lock(&self.scrapes).insert(provider, script);
    }

    pub fn set_probe(&self, target: ProbeTarget, data: Value) {
        lock(&self.probes).insert(target, data);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn was_called(&self, name: &str) -> bool {
        lock(&self.calls).iter().any(|call| call == name)
    }

    pub fn is_organized(&self) -> bool {
        lock(&self.probes).contains_key(&ProbeTarget::OrganizedToggle)
    }

    /// Cancels `control` right after `provider`'s fields are applied.
    pub fn cancel_after_apply(&self, provider: Provider, control: SessionControl) {
        *lock(&self.cancel_after_apply) = Some((provider, control));
    }

    /// `provider`'s apply never finishes.
    pub fn hang_apply(&self, provider: Provider) {
        *lock(&self.hang_apply) = Some(provider);
    }

    pub fn fail_open_editor(&self) {
        self.fail_open_editor.store(true, Ordering::SeqCst);
    }

    pub fn fail_save(&self) {
        self.fail_save.store(true, Ordering::SeqCst);
    }

    pub fn fail_mark_organized(&self, error: SurfaceError) {
        *lock(&self.fail_mark_organized) = Some(error);
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }
}

#[async_trait]
impl SceneSurface for FakeSurface {
    async fn open_editor(&self, _scene_id: &str) -> Result<(), SurfaceError> {
        self.record("open_editor");
        if self.fail_open_editor.load(Ordering::SeqCst) {
            return Err(SurfaceError::Unavailable("editor did not open".to_string()));
        }
        Ok(())
    }

    async fn scrape(&self, _scene_id: &str, provider: Provider) -> Result<ScrapeResult, SurfaceError> {
        self.record(format!("scrape:{}", provider.key()));
        let script = lock(&self.scrapes)
            .get(&provider)
            .cloned()
            .unwrap_or(ScrapeScript::NoMatch);
        match script {
            ScrapeScript::Match(scraped) => Ok(ScrapeResult::Matched(scraped)),
            ScrapeScript::NoMatch => Ok(ScrapeResult::NoMatch),
            ScrapeScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ScrapeResult::NoMatch)
            }
            ScrapeScript::Fail(error) => Err(error),
        }
    }

    async fn create_linked_entities(
        &self,
        _scene_id: &str,
        scraped: &ScrapedScene,
    ) -> Result<ScrapedScene, SurfaceError> {
        let label = scraped.remote_site_id.clone().unwrap_or_default();
        let provider = lock(&self.scrapes)
            .iter()
            .find(|(_, script)| {
                matches!(script, ScrapeScript::Match(candidate)
                    if candidate.remote_site_id.clone().unwrap_or_default() == label)
            })
            .map(|(provider, _)| provider.key())
            .unwrap_or("unknown");
        self.record(format!("create_linked:{provider}"));
        let fill = |entity: &mut ScrapedEntity| {
            if entity.is_missing() {
                entity.stored_id = Some(format!("new-{}", entity.name));
            }
        };
        let mut created = scraped.clone();
        if let Some(studio) = created.studio.as_mut() {
            fill(studio);
        }
        created.performers.iter_mut().for_each(fill);
        created.tags.iter_mut().for_each(fill);
        Ok(created)
    }

    async fn apply(
        &self,
        _scene_id: &str,
        provider: Provider,
        scraped: &ScrapedScene,
    ) -> Result<Vec<String>, SurfaceError> {
        self.record(format!("apply:{}", provider.key()));
        let hangs = *lock(&self.hang_apply) == Some(provider);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some((target, control)) = lock(&self.cancel_after_apply).as_ref() {
            if *target == provider {
                control.cancel();
            }
        }
        Ok(scraped.populated_fields())
    }

    async fn save(&self, _scene_id: &str) -> Result<(), SurfaceError> {
        self.record("save");
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(SurfaceError::Unavailable("save button disabled".to_string()));
        }
        Ok(())
    }

    async fn mark_organized(&self, _scene_id: &str) -> Result<(), SurfaceError> {
        self.record("mark_organized");
        if let Some(error) = lock(&self.fail_mark_organized).clone() {
            return Err(error);
        }
        self.set_probe(ProbeTarget::OrganizedToggle, json!(true));
        Ok(())
    }

    async fn probe(&self, _scene_id: &str, target: ProbeTarget) -> Result<Option<Value>, SurfaceError> {
        Ok(lock(&self.probes).get(&target).cloned())
    }
}

/// Answers from a fixed per-provider script; unlisted providers are applied.
pub struct ScriptedPrompt {
    decisions: Vec<(Provider, ApplyDecision)>,
}

impl ScriptedPrompt {
    pub fn new(decisions: Vec<(Provider, ApplyDecision)>) -> Self {
        Self { decisions }
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn decide(&self, _: &Scene, provider: Provider, _: &ScrapedScene, _: u8) -> ApplyDecision {
        self.decisions
            .iter()
            .find(|(candidate, _)| *candidate == provider)
            .map(|(_, decision)| *decision)
            .unwrap_or(ApplyDecision::Apply)
    }
}

/// Never answers for `provider`; applies everything else.
pub struct HangingPrompt {
    provider: Provider,
}

impl HangingPrompt {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl OperatorPrompt for HangingPrompt {
    async fn decide(&self, _: &Scene, provider: Provider, _: &ScrapedScene, _: u8) -> ApplyDecision {
        if provider == self.provider {
            std::future::pending::<()>().await;
        }
        ApplyDecision::Apply
    }
}

pub struct Harness {
    pub context: AppContext,
    pub surface: Arc<FakeSurface>,
    pub transport: Arc<FakeTransport>,
}

pub fn harness(config: Config) -> Harness {
    harness_with_prompt(config, AutoApprove)
}

pub fn harness_with_prompt<P: OperatorPrompt + 'static>(config: Config, prompt: P) -> Harness {
    let db = Arc::new(DbManager::open_in_memory().expect("in-memory database"));
    let transport = Arc::new(FakeTransport::default());
    let surface = Arc::new(FakeSurface::default());
    let fake = surface.clone();
    let context = AppContext::build(
        config,
        db,
        transport.clone(),
        move |_| fake as Arc<dyn SceneSurface>,
        Arc::new(prompt),
    );
    Harness {
        context,
        surface,
        transport,
    }
}
