//! Explicitly constructed service graph shared by the CLI and tests.

use std::sync::Arc;

use crate::{
    api_surface::ApiSurface,
    config::Config,
    credentials,
    db_manager::DbManager,
    detection::{default_chains, SourceDetector},
    engine::{AutomationEngine, EngineDeps},
    error::StoreError,
    history::HistoryStore,
    notify::Notifier,
    prompt::OperatorPrompt,
    query::{HttpTransport, QueryClient, QueryTransport},
    rescrape_queue::RescrapeQueue,
    source_stats::SourceStatsStore,
    status::StatusTracker,
    surface::SceneSurface,
};

pub struct AppContext {
    pub config: Config,
    pub db: Arc<DbManager>,
    pub client: Arc<QueryClient>,
    pub tracker: Arc<StatusTracker>,
    pub history: Arc<HistoryStore>,
    pub queue: Arc<RescrapeQueue>,
    pub stats: Arc<SourceStatsStore>,
    pub notifier: Notifier,
    pub engine: AutomationEngine,
}

impl AppContext {
    /// Wires every service. `surface` receives the shared query client so a
    /// query-API-backed surface reuses its cache.
    pub fn build<F>(
        config: Config,
        db: Arc<DbManager>,
        transport: Arc<dyn QueryTransport>,
        surface: F,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self
    where
        F: FnOnce(&Arc<QueryClient>) -> Arc<dyn SceneSurface>,
    {
        let client = Arc::new(QueryClient::new(transport, &config.api));
        let surface = surface(&client);
        let detector = SourceDetector::new(
            client.clone(),
            default_chains(&config.providers, Some(surface.clone())),
            config.automation.debug_logging,
        );
        let tracker = Arc::new(StatusTracker::new(client.clone(), detector));
        let history = Arc::new(HistoryStore::new(db.clone(), &config.history));
        let queue = Arc::new(RescrapeQueue::new(db.clone(), &config.queue));
        let stats = Arc::new(SourceStatsStore::new(db.clone()));
        let notifier = Notifier::new(config.notifications.enabled);
        let engine = AutomationEngine::new(
            &config,
            EngineDeps {
                client: client.clone(),
                tracker: tracker.clone(),
                surface,
                prompt,
                stats: stats.clone(),
                queue: queue.clone(),
                history: history.clone(),
                notifier: notifier.clone(),
            },
        );
        Self {
            config,
            db,
            client,
            tracker,
            history,
            queue,
            stats,
            notifier,
            engine,
        }
    }

    /// Production wiring: HTTP transport, the on-disk database and a
    /// query-API-backed surface.
    pub fn open(config: Config, prompt: Arc<dyn OperatorPrompt>) -> Result<Self, StoreError> {
        let db = Arc::new(DbManager::open_default()?);
        let api_key = credentials::resolve_api_key(&config.api.endpoint);
        let transport: Arc<dyn QueryTransport> = Arc::new(HttpTransport::new(
            &config.api.endpoint,
            api_key,
            config.api.request_timeout_ms,
        ));
        let providers = config.providers.clone();
        Ok(Self::build(
            config,
            db,
            transport,
            move |client| Arc::new(ApiSurface::new(client.clone(), providers)),
            prompt,
        ))
    }
}
