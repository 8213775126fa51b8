//! Abstract command contract for the external application's interactive
//! surface. The engine only speaks this trait; how the surface is driven
//! (API calls, a browser, a test fake) is up to the implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SurfaceError;
use crate::model::{Provider, ScrapeResult, ScrapedScene};

/// Element or condition a detection strategy can look for on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    /// Provider identifier rendered in the scene's detail view.
    ProviderIdentifier(Provider),
    /// Link to one of the provider's scene pages.
    ProviderLink(Provider),
    /// The processed/organized toggle in its "on" state.
    OrganizedToggle,
}

#[async_trait]
pub trait SceneSurface: Send + Sync {
    /// Opens the scene's editing surface. Failure here is fatal to a session.
    async fn open_editor(&self, scene_id: &str) -> Result<(), SurfaceError>;

    /// Invokes the provider's scrape action.
    async fn scrape(&self, scene_id: &str, provider: Provider)
        -> Result<ScrapeResult, SurfaceError>;

    /// Creates linked entities with no stored id and returns the scraped
    /// set with the new ids filled in.
    async fn create_linked_entities(
        &self,
        scene_id: &str,
        scraped: &ScrapedScene,
    ) -> Result<ScrapedScene, SurfaceError>;

    /// Applies scraped fields; returns the names of fields that changed.
    async fn apply(
        &self,
        scene_id: &str,
        provider: Provider,
        scraped: &ScrapedScene,
    ) -> Result<Vec<String>, SurfaceError>;

    async fn save(&self, scene_id: &str) -> Result<(), SurfaceError>;

    async fn mark_organized(&self, scene_id: &str) -> Result<(), SurfaceError>;

    /// `Ok(Some(data))` when the target is present, `Ok(None)` when absent.
    async fn probe(&self, scene_id: &str, target: ProbeTarget)
        -> Result<Option<Value>, SurfaceError>;
}
