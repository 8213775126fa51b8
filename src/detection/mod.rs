//! Confidence-ranked detection of existing enrichment per source.
//!
//! Each source owns a fixed chain of strategies sorted by descending
//! confidence. The first strategy that reports a finding wins; errors are
//! logged and treated as "not found" so the chain keeps going.

pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use crate::config::ProvidersConfig;
use crate::error::DetectionError;
use crate::model::{Provider, Scene, SourceKey, SourceStatus};
use crate::query::{find_scene, QueryClient};
use crate::surface::SceneSurface;

use self::strategies::{
    ApiOrganizedStrategy, StashIdStrategy, SurfaceProbeStrategy, UrlPatternStrategy,
};

#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn confidence(&self) -> u8;
    /// `Ok(Some(data))` when the source's enrichment is present.
    async fn try_detect(&self, scene: &Scene) -> Result<Option<Value>, DetectionError>;
}

pub type StrategyChain = Vec<Box<dyn DetectionStrategy>>;

fn sort_chain(mut chain: StrategyChain) -> StrategyChain {
    chain.sort_by(|left, right| right.confidence().cmp(&left.confidence()));
    chain
}

/// Default chains: API evidence first, then surface evidence when a surface
/// is available, then content patterns.
pub fn default_chains(
    providers: &ProvidersConfig,
    surface: Option<Arc<dyn SceneSurface>>,
) -> HashMap<SourceKey, StrategyChain> {
    let mut chains = HashMap::new();
    for provider in Provider::ALL {
        let provider_config = providers.get(provider);
        let mut chain: StrategyChain = vec![Box::new(StashIdStrategy::new(provider_config))];
        if let Some(surface) = &surface {
            chain.push(Box::new(SurfaceProbeStrategy::identifier(
                provider,
                surface.clone(),
            )));
            chain.push(Box::new(SurfaceProbeStrategy::link(provider, surface.clone())));
        }
        chain.push(Box::new(UrlPatternStrategy::new(provider_config)));
        chains.insert(SourceKey::Provider(provider), sort_chain(chain));
    }

    let mut organized: StrategyChain = vec![Box::new(ApiOrganizedStrategy)];
    if let Some(surface) = surface {
        organized.push(Box::new(SurfaceProbeStrategy::organized(surface)));
    }
    chains.insert(SourceKey::Organized, sort_chain(organized));
    chains
}

pub struct SourceDetector {
    client: Arc<QueryClient>,
    chains: HashMap<SourceKey, StrategyChain>,
    debug_logging: bool,
}

impl SourceDetector {
    pub fn new(
        client: Arc<QueryClient>,
        chains: HashMap<SourceKey, StrategyChain>,
        debug_logging: bool,
    ) -> Self {
        let chains = chains
            .into_iter()
            .map(|(key, chain)| (key, sort_chain(chain)))
            .collect();
        Self {
            client,
            chains,
            debug_logging,
        }
    }

    /// Detects `key` for a scene. A snapshot the caller already holds is
    /// used directly; otherwise the scene is fetched through the cache.
    pub async fn detect(
        &self,
        key: SourceKey,
        scene_id: &str,
        snapshot: Option<&Scene>,
    ) -> SourceStatus {
        match snapshot {
            Some(scene) => self.run_chain(key, scene).await,
            None => match find_scene(&self.client, scene_id).await {
                Ok(scene) => self.run_chain(key, &scene).await,
                Err(err) => {
                    warn!(
                        "Detection[scene:{}]: could not load scene for {}: {}",
                        scene_id, key, err
                    );
                    SourceStatus::not_found()
                }
            },
        }
    }

    pub async fn detect_provider(
        &self,
        provider: Provider,
        scene_id: &str,
        snapshot: Option<&Scene>,
    ) -> SourceStatus {
        self.detect(SourceKey::Provider(provider), scene_id, snapshot)
            .await
    }

    async fn run_chain(&self, key: SourceKey, scene: &Scene) -> SourceStatus {
        let Some(chain) = self.chains.get(&key) else {
            return SourceStatus::not_found();
        };
        for strategy in chain {
            match strategy.try_detect(scene).await {
                Ok(Some(data)) => {
                    if self.debug_logging {
                        debug!(
                            "Detection[{}]: {} found by {} ({}%)",
                            scene.label(),
                            key,
                            strategy.name(),
                            strategy.confidence()
                        );
                    }
                    return SourceStatus::found(strategy.name(), strategy.confidence(), Some(data));
                }
                Ok(None) => {
                    if self.debug_logging {
                        debug!(
                            "Detection[{}]: {} not found by {}",
                            scene.label(),
                            key,
                            strategy.name()
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        "Detection[{}]: strategy {} failed for {}: {}",
                        scene.label(),
                        strategy.name(),
                        key,
                        err
                    );
                }
            }
        }
        SourceStatus::not_found()
    }
}
