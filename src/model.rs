//! Domain types: scenes as read from the query API, per-source detection
//! results, completion snapshots and scraped field sets.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// External metadata provider that can be scraped for a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    StashDb,
    ThePornDb,
}

impl Provider {
    /// Every provider, in the fixed order used for recommendations.
    pub const ALL: [Provider; 2] = [Provider::StashDb, Provider::ThePornDb];

    /// Stable key used in config sections and persisted stores.
    pub fn key(self) -> &'static str {
        match self {
            Self::StashDb => "stashdb",
            Self::ThePornDb => "theporndb",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::StashDb => "StashDB",
            Self::ThePornDb => "ThePornDB",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "stashdb" | "stash" | "a" => Ok(Self::StashDb),
            "theporndb" | "tpdb" | "porndb" | "b" => Ok(Self::ThePornDb),
            _ => Err(format!("unknown provider: {value}")),
        }
    }
}

/// Provider identifier attached to a scene (`stash_ids` entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentifier {
    pub endpoint: String,
    #[serde(rename = "stash_id")]
    pub remote_id: String,
}

/// Linked entity reference (performer, studio, tag).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Scene record as returned by the query API. Owned by the external
/// application; this crate only reads it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    pub organized: bool,
    pub urls: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub details: String,
    #[serde(deserialize_with = "null_as_default")]
    pub date: String,
    #[serde(rename = "stash_ids")]
    pub provider_identifiers: Vec<ProviderIdentifier>,
    pub performers: Vec<NamedRef>,
    pub studio: Option<NamedRef>,
    pub tags: Vec<NamedRef>,
    #[serde(deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(deserialize_with = "null_as_default")]
    pub updated_at: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Scene {
    pub fn label(&self) -> String {
        format!("scene:{}", self.id)
    }

    /// First provider identifier whose endpoint contains `endpoint_pattern`
    /// (case-insensitive).
    pub fn identifier_matching(&self, endpoint_pattern: &str) -> Option<&ProviderIdentifier> {
        let pattern = endpoint_pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return None;
        }
        self.provider_identifiers.iter().find(|identifier| {
            identifier.endpoint.to_ascii_lowercase().contains(&pattern)
                && !identifier.remote_id.trim().is_empty()
        })
    }
}

/// What a detection pass is about: a provider or the processed flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKey {
    Provider(Provider),
    Organized,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(provider) => write!(f, "{provider}"),
            Self::Organized => f.write_str("organized"),
        }
    }
}

/// Result of one detection pass for one source. Superseded wholesale on
/// every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub found: bool,
    pub confidence: u8,
    pub strategy_name: String,
    pub data: Option<Value>,
    pub timestamp_ms: i64,
}

impl SourceStatus {
    pub fn not_found() -> Self {
        Self {
            found: false,
            confidence: 0,
            strategy_name: "none".to_string(),
            data: None,
            timestamp_ms: now_unix_ms(),
        }
    }

    pub fn found(strategy_name: &str, confidence: u8, data: Option<Value>) -> Self {
        Self {
            found: true,
            confidence: confidence.min(100),
            strategy_name: strategy_name.to_string(),
            data,
            timestamp_ms: now_unix_ms(),
        }
    }
}

/// Per-provider entry of a completion snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: Provider,
    pub status: SourceStatus,
}

/// Read-only view of a scene's enrichment state. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSnapshot {
    pub scene: Scene,
    pub per_source: Vec<ProviderStatus>,
    pub organized: SourceStatus,
    pub percentage: u8,
    pub recommendations: Vec<String>,
}

impl CompletionSnapshot {
    pub fn status_for(&self, provider: Provider) -> Option<&SourceStatus> {
        self.per_source
            .iter()
            .find(|entry| entry.provider == provider)
            .map(|entry| &entry.status)
    }

    pub fn is_found(&self, provider: Provider) -> bool {
        self.status_for(provider).is_some_and(|status| status.found)
    }
}

/// Linked entity in a scraped result. `stored_id` is set when the external
/// application already knows the entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapedEntity {
    pub name: String,
    pub stored_id: Option<String>,
    pub remote_site_id: Option<String>,
}

impl ScrapedEntity {
    pub fn is_missing(&self) -> bool {
        self.stored_id
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
    }
}

/// Field set returned by one provider scrape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapedScene {
    pub title: Option<String>,
    pub details: Option<String>,
    pub date: Option<String>,
    pub urls: Vec<String>,
    pub image: Option<String>,
    pub studio: Option<ScrapedEntity>,
    pub performers: Vec<ScrapedEntity>,
    pub tags: Vec<ScrapedEntity>,
    pub remote_site_id: Option<String>,
}

impl ScrapedScene {
    /// Names of the fields this result would set.
    pub fn populated_fields(&self) -> Vec<String> {
        let text = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        [
            ("title", text(&self.title)),
            ("details", text(&self.details)),
            ("date", text(&self.date)),
            ("urls", !self.urls.is_empty()),
            ("cover_image", text(&self.image)),
            ("studio", self.studio.is_some()),
            ("performers", !self.performers.is_empty()),
            ("tags", !self.tags.is_empty()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| name.to_string())
        .collect()
    }

    /// Linked entities that do not exist yet in the external application.
    pub fn missing_entities(&self) -> usize {
        let studio = usize::from(self.studio.as_ref().is_some_and(ScrapedEntity::is_missing));
        studio
            + self.performers.iter().filter(|entity| entity.is_missing()).count()
            + self.tags.iter().filter(|entity| entity.is_missing()).count()
    }
}

/// Outcome of invoking a provider's scrape action.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeResult {
    Matched(ScrapedScene),
    NoMatch,
}
