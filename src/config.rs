//! Persistent automation configuration model and defaults.

use crate::model::Provider;

/// Root configuration persisted to `autoscrape.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Query API connection and client-side cache.
    pub api: ApiConfig,
    #[serde(default)]
    /// Engine behavior toggles and thresholds.
    pub automation: AutomationConfig,
    #[serde(default)]
    /// Per-provider scrape settings.
    pub providers: ProvidersConfig,
    #[serde(default)]
    /// Adaptive source routing.
    pub routing: RoutingConfig,
    #[serde(default)]
    /// Rescrape queue scheduling.
    pub queue: QueueConfig,
    #[serde(default)]
    /// Automation history retention.
    pub history: HistoryConfig,
    #[serde(default)]
    /// Session summary notifications.
    pub notifications: NotificationsConfig,
    #[serde(default)]
    /// Per-field weights for scraped result scoring.
    pub scoring: ScoringConfig,
}

/// Query API endpoint and request behavior.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Zero disables request pacing.
    #[serde(default)]
    pub max_requests_per_second: u32,
}

/// Condition under which a scene is marked organized after a session.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrganizePolicy {
    /// Every enabled provider must be satisfied.
    #[default]
    All,
    /// At least one enabled provider must be satisfied.
    Any,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub auto_apply: bool,
    #[serde(default = "default_true")]
    pub skip_already_scraped: bool,
    #[serde(default = "default_true")]
    pub auto_organize: bool,
    #[serde(default)]
    pub organize_policy: OrganizePolicy,
    #[serde(default = "default_true")]
    pub create_linked_entities: bool,
    #[serde(default = "default_min_auto_apply_score")]
    pub min_auto_apply_score: u8,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub debug_logging: bool,
}

/// Scrape settings for one provider.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ProviderConfig {
    /// Whether the engine scrapes this provider automatically.
    #[serde(default = "default_true")]
    pub auto_scrape: bool,
    /// Substring matched against `stash_ids[].endpoint`.
    #[serde(default)]
    pub endpoint_pattern: String,
    /// Substrings matched against scene URLs by the content-pattern strategy.
    #[serde(default)]
    pub url_patterns: Vec<String>,
    /// Scraper source handed to the external application (stash-box endpoint).
    #[serde(default)]
    pub scraper_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_stashdb_provider")]
    pub stashdb: ProviderConfig,
    #[serde(default = "default_theporndb_provider")]
    pub theporndb: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::StashDb => &self.stashdb,
            Provider::ThePornDb => &self.theporndb,
        }
    }

    pub fn get_mut(&mut self, provider: Provider) -> &mut ProviderConfig {
        match provider {
            Provider::StashDb => &mut self.stashdb,
            Provider::ThePornDb => &mut self.theporndb,
        }
    }

    /// Providers with auto-scrape turned on, in fixed provider order.
    pub fn enabled(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|provider| self.get(*provider).auto_scrape)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub adaptive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_retry_interval_minutes")]
    pub retry_interval_minutes: u32,
    #[serde(default = "default_max_backoff_minutes")]
    pub max_backoff_minutes: u32,
    #[serde(default = "default_true")]
    pub enqueue_on_low_score: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_history_max_error_chars")]
    pub max_error_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Additive weights; the summed score is clamped to 0..=100.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ScoringConfig {
    #[serde(default = "default_weight_title")]
    pub title: u32,
    #[serde(default = "default_weight_date")]
    pub date: u32,
    #[serde(default = "default_weight_details")]
    pub details: u32,
    #[serde(default = "default_weight_studio")]
    pub studio: u32,
    #[serde(default = "default_weight_performers")]
    pub performers: u32,
    #[serde(default = "default_weight_tags")]
    pub tags: u32,
    #[serde(default = "default_weight_urls")]
    pub urls: u32,
    #[serde(default = "default_weight_image")]
    pub image: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_max_entries: default_cache_max_entries(),
            max_requests_per_second: 0,
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            auto_apply: true,
            skip_already_scraped: true,
            auto_organize: true,
            organize_policy: OrganizePolicy::All,
            create_linked_entities: true,
            min_auto_apply_score: default_min_auto_apply_score(),
            step_timeout_ms: default_step_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            debug_logging: false,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            stashdb: default_stashdb_provider(),
            theporndb: default_theporndb_provider(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_interval_minutes: default_retry_interval_minutes(),
            max_backoff_minutes: default_max_backoff_minutes(),
            enqueue_on_low_score: true,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_history_max_entries(),
            max_error_chars: default_history_max_error_chars(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            title: default_weight_title(),
            date: default_weight_date(),
            details: default_weight_details(),
            studio: default_weight_studio(),
            performers: default_weight_performers(),
            tags: default_weight_tags(),
            urls: default_weight_urls(),
            image: default_weight_image(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_endpoint() -> String {
    "http://localhost:9999/graphql".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_min_auto_apply_score() -> u8 {
    50
}

fn default_step_timeout_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_retry_interval_minutes() -> u32 {
    60
}

fn default_max_backoff_minutes() -> u32 {
    24 * 60
}

fn default_history_max_entries() -> usize {
    500
}

fn default_history_max_error_chars() -> usize {
    200
}

fn default_weight_title() -> u32 {
    20
}

fn default_weight_date() -> u32 {
    10
}

fn default_weight_details() -> u32 {
    10
}

fn default_weight_studio() -> u32 {
    15
}

fn default_weight_performers() -> u32 {
    20
}

fn default_weight_tags() -> u32 {
    10
}

fn default_weight_urls() -> u32 {
    10
}

fn default_weight_image() -> u32 {
    5
}

pub fn default_stashdb_provider() -> ProviderConfig {
    ProviderConfig {
        auto_scrape: true,
        endpoint_pattern: "stashdb.org".to_string(),
        url_patterns: vec!["stashdb.org/scenes/".to_string()],
        scraper_source: "https://stashdb.org/graphql".to_string(),
    }
}

pub fn default_theporndb_provider() -> ProviderConfig {
    ProviderConfig {
        auto_scrape: true,
        endpoint_pattern: "theporndb.net".to_string(),
        url_patterns: vec![
            "theporndb.net/scenes/".to_string(),
            "metadataapi.net".to_string(),
        ],
        scraper_source: "https://theporndb.net/graphql".to_string(),
    }
}

fn sanitize_provider(provider: &ProviderConfig, defaults: ProviderConfig) -> ProviderConfig {
    let endpoint_pattern = provider.endpoint_pattern.trim();
    let scraper_source = provider.scraper_source.trim();
    let url_patterns: Vec<String> = provider
        .url_patterns
        .iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .collect();
    ProviderConfig {
        auto_scrape: provider.auto_scrape,
        endpoint_pattern: if endpoint_pattern.is_empty() {
            defaults.endpoint_pattern
        } else {
            endpoint_pattern.to_string()
        },
        url_patterns: if url_patterns.is_empty() {
            defaults.url_patterns
        } else {
            url_patterns
        },
        scraper_source: if scraper_source.is_empty() {
            defaults.scraper_source
        } else {
            scraper_source.to_string()
        },
    }
}

/// Clamps numeric settings and fills blank provider patterns from defaults.
pub fn sanitize_config(config: Config) -> Config {
    let endpoint = config.api.endpoint.trim();
    Config {
        api: ApiConfig {
            endpoint: if endpoint.is_empty() {
                default_api_endpoint()
            } else {
                endpoint.to_string()
            },
            request_timeout_ms: config.api.request_timeout_ms.clamp(100, 300_000),
            cache_ttl_ms: config.api.cache_ttl_ms.max(1),
            cache_max_entries: config.api.cache_max_entries.max(1),
            max_requests_per_second: config.api.max_requests_per_second,
        },
        automation: AutomationConfig {
            min_auto_apply_score: config.automation.min_auto_apply_score.min(100),
            step_timeout_ms: config.automation.step_timeout_ms.clamp(100, 600_000),
            poll_interval_ms: config.automation.poll_interval_ms.clamp(10, 5_000),
            ..config.automation
        },
        providers: ProvidersConfig {
            stashdb: sanitize_provider(&config.providers.stashdb, default_stashdb_provider()),
            theporndb: sanitize_provider(
                &config.providers.theporndb,
                default_theporndb_provider(),
            ),
        },
        routing: config.routing,
        queue: QueueConfig {
            retry_interval_minutes: config.queue.retry_interval_minutes.max(1),
            max_backoff_minutes: config.queue.max_backoff_minutes.max(1),
            enqueue_on_low_score: config.queue.enqueue_on_low_score,
        },
        history: HistoryConfig {
            max_entries: config.history.max_entries.max(1),
            max_error_chars: config.history.max_error_chars.max(16),
        },
        notifications: config.notifications,
        scoring: config.scoring,
    }
}
