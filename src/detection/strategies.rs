//! Concrete detection strategies, one per evidence tier.
//!
//! Confidence tiers: API identifier 100, surface identifier 95, surface
//! link 85, URL pattern 75. The processed flag uses the API field (100)
//! with a surface toggle fallback (90).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::detection::DetectionStrategy;
use crate::error::DetectionError;
use crate::model::{Provider, Scene};
use crate::surface::{ProbeTarget, SceneSurface};

pub const STASH_ID_CONFIDENCE: u8 = 100;
pub const SURFACE_IDENTIFIER_CONFIDENCE: u8 = 95;
pub const SURFACE_LINK_CONFIDENCE: u8 = 85;
pub const URL_PATTERN_CONFIDENCE: u8 = 75;
pub const API_ORGANIZED_CONFIDENCE: u8 = 100;
pub const SURFACE_ORGANIZED_CONFIDENCE: u8 = 90;

/// Looks for the provider's endpoint in the scene's `stash_ids`.
pub struct StashIdStrategy {
    endpoint_pattern: String,
}

impl StashIdStrategy {
    pub fn new(provider: &ProviderConfig) -> Self {
        Self {
            endpoint_pattern: provider.endpoint_pattern.clone(),
        }
    }
}

#[async_trait]
impl DetectionStrategy for StashIdStrategy {
    fn name(&self) -> &'static str {
        "stash_id"
    }

    fn confidence(&self) -> u8 {
        STASH_ID_CONFIDENCE
    }

    async fn try_detect(&self, scene: &Scene) -> Result<Option<Value>, DetectionError> {
        Ok(scene
            .identifier_matching(&self.endpoint_pattern)
            .map(|identifier| {
                json!({
                    "endpoint": identifier.endpoint,
                    "stashId": identifier.remote_id,
                })
            }))
    }
}

/// Asks the surface whether it renders a probe target for the scene.
pub struct SurfaceProbeStrategy {
    name: &'static str,
    confidence: u8,
    target: ProbeTarget,
    surface: Arc<dyn SceneSurface>,
}

impl SurfaceProbeStrategy {
    pub fn identifier(provider: Provider, surface: Arc<dyn SceneSurface>) -> Self {
        Self {
            name: "surface_identifier",
            confidence: SURFACE_IDENTIFIER_CONFIDENCE,
            target: ProbeTarget::ProviderIdentifier(provider),
            surface,
        }
    }

    pub fn link(provider: Provider, surface: Arc<dyn SceneSurface>) -> Self {
        Self {
            name: "surface_link",
            confidence: SURFACE_LINK_CONFIDENCE,
            target: ProbeTarget::ProviderLink(provider),
            surface,
        }
    }

    pub fn organized(surface: Arc<dyn SceneSurface>) -> Self {
        Self {
            name: "surface_organized",
            confidence: SURFACE_ORGANIZED_CONFIDENCE,
            target: ProbeTarget::OrganizedToggle,
            surface,
        }
    }
}

#[async_trait]
impl DetectionStrategy for SurfaceProbeStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn confidence(&self) -> u8 {
        self.confidence
    }

    async fn try_detect(&self, scene: &Scene) -> Result<Option<Value>, DetectionError> {
        Ok(self.surface.probe(&scene.id, self.target).await?)
    }
}

/// Matches the scene's URLs against the provider's known URL patterns.
pub struct UrlPatternStrategy {
    patterns: Vec<String>,
}

impl UrlPatternStrategy {
    pub fn new(provider: &ProviderConfig) -> Self {
        Self {
            patterns: provider
                .url_patterns
                .iter()
                .map(|pattern| pattern.trim().to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl DetectionStrategy for UrlPatternStrategy {
    fn name(&self) -> &'static str {
        "url_pattern"
    }

    fn confidence(&self) -> u8 {
        URL_PATTERN_CONFIDENCE
    }

    async fn try_detect(&self, scene: &Scene) -> Result<Option<Value>, DetectionError> {
        Ok(scene
            .urls
            .iter()
            .find(|url| {
                let lowered = url.to_ascii_lowercase();
                self.patterns.iter().any(|pattern| lowered.contains(pattern))
            })
            .map(|url| json!({ "url": url })))
    }
}

/// Reads the `organized` flag from the API snapshot.
pub struct ApiOrganizedStrategy;

#[async_trait]
impl DetectionStrategy for ApiOrganizedStrategy {
    fn name(&self) -> &'static str {
        "api_organized"
    }

    fn confidence(&self) -> u8 {
        API_ORGANIZED_CONFIDENCE
    }

    async fn try_detect(&self, scene: &Scene) -> Result<Option<Value>, DetectionError> {
        Ok(scene.organized.then(|| json!({ "organized": true })))
    }
}
