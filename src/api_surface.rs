//! Scene surface driven entirely through the query API.
//!
//! Scrapes go through `scrapeSingleScene`, missing linked entities are
//! created with the matching `*Create` mutation, and applying merges the
//! scraped fields into a `sceneUpdate`. Probes are answered from the cached
//! scene snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Map, Value};

use crate::config::ProvidersConfig;
use crate::error::{QueryError, SurfaceError};
use crate::model::{Provider, Scene, ScrapeResult, ScrapedEntity, ScrapedScene};
use crate::query::{find_scene, invalidate_scene, QueryClient};
use crate::surface::{ProbeTarget, SceneSurface};

const SCRAPE_SINGLE_SCENE: &str = r#"query ScrapeSingleScene($source: ScraperSourceInput!, $input: ScrapeSingleSceneInput!) {
  scrapeSingleScene(source: $source, input: $input) {
    title
    details
    date
    urls
    image
    remote_site_id
    studio { stored_id name remote_site_id }
    performers { stored_id name remote_site_id }
    tags { stored_id name }
  }
}"#;

const PERFORMER_CREATE: &str = r#"mutation PerformerCreate($input: PerformerCreateInput!) {
  performerCreate(input: $input) { id }
}"#;

const STUDIO_CREATE: &str = r#"mutation StudioCreate($input: StudioCreateInput!) {
  studioCreate(input: $input) { id }
}"#;

const TAG_CREATE: &str = r#"mutation TagCreate($input: TagCreateInput!) {
  tagCreate(input: $input) { id }
}"#;

const SCENE_UPDATE: &str = r#"mutation SceneUpdate($input: SceneUpdateInput!) {
  sceneUpdate(input: $input) { id }
}"#;

#[derive(Debug, Clone, Copy)]
enum EntityKind {
    Performer,
    Studio,
    Tag,
}

impl EntityKind {
    fn document(self) -> &'static str {
        match self {
            Self::Performer => PERFORMER_CREATE,
            Self::Studio => STUDIO_CREATE,
            Self::Tag => TAG_CREATE,
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Performer => "performerCreate",
            Self::Studio => "studioCreate",
            Self::Tag => "tagCreate",
        }
    }
}

fn surface_error(error: QueryError) -> SurfaceError {
    match error {
        QueryError::Timeout { timeout_ms } => {
            SurfaceError::Timeout(format!("query API did not answer within {timeout_ms} ms"))
        }
        other => SurfaceError::Query(other),
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, field)| !field.is_null())
                .map(|(key, field)| (key, strip_nulls(field)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

fn scraper_source(source: &str) -> Value {
    if source.starts_with("http://") || source.starts_with("https://") {
        json!({ "stash_box_endpoint": source })
    } else {
        json!({ "scraper_id": source })
    }
}

fn merge_ids(existing: impl Iterator<Item = String>, scraped: &[ScrapedEntity]) -> Vec<String> {
    let mut ids: Vec<String> = existing.collect();
    for id in scraped.iter().filter_map(|entity| entity.stored_id.clone()) {
        if !id.trim().is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

pub struct ApiSurface {
    client: Arc<QueryClient>,
    providers: ProvidersConfig,
}

impl ApiSurface {
    pub fn new(client: Arc<QueryClient>, providers: ProvidersConfig) -> Self {
        Self { client, providers }
    }

    async fn scene(&self, scene_id: &str) -> Result<Scene, SurfaceError> {
        find_scene(&self.client, scene_id).await.map_err(|err| match err {
            QueryError::Api(_) => SurfaceError::NotFound(format!("scene {scene_id}")),
            other => surface_error(other),
        })
    }

    async fn create_entity(&self, kind: EntityKind, name: &str) -> Result<String, SurfaceError> {
        let data = self
            .client
            .query(kind.document(), json!({ "input": { "name": name } }))
            .await
            .map_err(surface_error)?;
        data.get(kind.field())
            .and_then(|created| created.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SurfaceError::Query(QueryError::Decode(format!(
                    "{} returned no id",
                    kind.field()
                )))
            })
    }

    async fn ensure_entity(
        &self,
        kind: EntityKind,
        entity: &ScrapedEntity,
    ) -> Result<ScrapedEntity, SurfaceError> {
        if !entity.is_missing() || entity.name.trim().is_empty() {
            return Ok(entity.clone());
        }
        let id = self.create_entity(kind, entity.name.trim()).await?;
        debug!("ApiSurface: created {:?} '{}' as {}", kind, entity.name, id);
        Ok(ScrapedEntity {
            stored_id: Some(id),
            ..entity.clone()
        })
    }

    fn update_input(&self, scene: &Scene, provider: Provider, scraped: &ScrapedScene) -> Value {
        let mut input = Map::new();
        input.insert("id".to_string(), json!(scene.id));
        let mut set_text = |key: &str, value: &Option<String>| {
            if let Some(text) = value.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
                input.insert(key.to_string(), json!(text));
            }
        };
        set_text("title", &scraped.title);
        set_text("details", &scraped.details);
        set_text("date", &scraped.date);
        set_text("cover_image", &scraped.image);

        if !scraped.urls.is_empty() {
            let mut urls = scene.urls.clone();
            for url in &scraped.urls {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
            input.insert("urls".to_string(), json!(urls));
        }
        if let Some(studio_id) = scraped
            .studio
            .as_ref()
            .and_then(|studio| studio.stored_id.clone())
        {
            input.insert("studio_id".to_string(), json!(studio_id));
        }
        if !scraped.performers.is_empty() {
            let ids = merge_ids(
                scene.performers.iter().map(|performer| performer.id.clone()),
                &scraped.performers,
            );
            input.insert("performer_ids".to_string(), json!(ids));
        }
        if !scraped.tags.is_empty() {
            let ids = merge_ids(scene.tags.iter().map(|tag| tag.id.clone()), &scraped.tags);
            input.insert("tag_ids".to_string(), json!(ids));
        }

        let provider_config = self.providers.get(provider);
        if let Some(remote_id) = scraped
            .remote_site_id
            .as_deref()
            .filter(|remote_id| !remote_id.trim().is_empty())
        {
            let mut stash_ids: Vec<Value> = scene
                .provider_identifiers
                .iter()
                .map(|identifier| {
                    json!({ "endpoint": identifier.endpoint, "stash_id": identifier.remote_id })
                })
                .collect();
            if scene
                .identifier_matching(&provider_config.endpoint_pattern)
                .is_none()
            {
                stash_ids.push(json!({
                    "endpoint": provider_config.scraper_source,
                    "stash_id": remote_id,
                }));
            }
            input.insert("stash_ids".to_string(), Value::Array(stash_ids));
        }
        Value::Object(input)
    }

    async fn update_scene(&self, scene_id: &str, input: Value) -> Result<(), SurfaceError> {
        self.client
            .query(SCENE_UPDATE, json!({ "input": input }))
            .await
            .map_err(surface_error)?;
        invalidate_scene(&self.client, scene_id);
        Ok(())
    }
}

#[async_trait]
impl SceneSurface for ApiSurface {
    async fn open_editor(&self, scene_id: &str) -> Result<(), SurfaceError> {
        self.scene(scene_id).await.map(|_| ())
    }

    async fn scrape(&self, scene_id: &str, provider: Provider) -> Result<ScrapeResult, SurfaceError> {
        let source = scraper_source(&self.providers.get(provider).scraper_source);
        let data = self
            .client
            .query(
                SCRAPE_SINGLE_SCENE,
                json!({ "source": source, "input": { "scene_id": scene_id } }),
            )
            .await
            .map_err(surface_error)?;
        let first = data
            .get("scrapeSingleScene")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .cloned();
        match first {
            None | Some(Value::Null) => Ok(ScrapeResult::NoMatch),
            Some(result) => serde_json::from_value(strip_nulls(result))
                .map(ScrapeResult::Matched)
                .map_err(|err| SurfaceError::Query(QueryError::Decode(err.to_string()))),
        }
    }

    async fn create_linked_entities(
        &self,
        _scene_id: &str,
        scraped: &ScrapedScene,
    ) -> Result<ScrapedScene, SurfaceError> {
        let studio = match &scraped.studio {
            Some(studio) => Some(self.ensure_entity(EntityKind::Studio, studio).await?),
            None => None,
        };
        let mut performers = Vec::with_capacity(scraped.performers.len());
        for performer in &scraped.performers {
            performers.push(self.ensure_entity(EntityKind::Performer, performer).await?);
        }
        let mut tags = Vec::with_capacity(scraped.tags.len());
        for tag in &scraped.tags {
            tags.push(self.ensure_entity(EntityKind::Tag, tag).await?);
        }
        Ok(ScrapedScene {
            studio,
            performers,
            tags,
            ..scraped.clone()
        })
    }

    async fn apply(
        &self,
        scene_id: &str,
        provider: Provider,
        scraped: &ScrapedScene,
    ) -> Result<Vec<String>, SurfaceError> {
        let scene = self.scene(scene_id).await?;
        let input = self.update_input(&scene, provider, scraped);
        let fields: Vec<String> = input
            .as_object()
            .map(|map| map.keys().filter(|key| *key != "id").cloned().collect())
            .unwrap_or_default();
        self.update_scene(scene_id, input).await?;
        info!(
            "ApiSurface[scene:{}]: applied {} from {}",
            scene_id,
            fields.join(", "),
            provider
        );
        Ok(fields)
    }

    async fn save(&self, scene_id: &str) -> Result<(), SurfaceError> {
        // Updates are persisted by the mutation; confirm the scene reloads.
        invalidate_scene(&self.client, scene_id);
        self.scene(scene_id).await.map(|_| ())
    }

    async fn mark_organized(&self, scene_id: &str) -> Result<(), SurfaceError> {
        self.update_scene(scene_id, json!({ "id": scene_id, "organized": true }))
            .await
    }

    async fn probe(&self, scene_id: &str, target: ProbeTarget) -> Result<Option<Value>, SurfaceError> {
        let scene = self.scene(scene_id).await?;
        let found = match target {
            ProbeTarget::ProviderIdentifier(provider) => scene
                .identifier_matching(&self.providers.get(provider).endpoint_pattern)
                .map(|identifier| json!({ "stashId": identifier.remote_id })),
            ProbeTarget::ProviderLink(provider) => {
                let patterns = &self.providers.get(provider).url_patterns;
                scene
                    .urls
                    .iter()
                    .find(|url| {
                        let lowered = url.to_ascii_lowercase();
                        patterns
                            .iter()
                            .any(|pattern| lowered.contains(&pattern.to_ascii_lowercase()))
                    })
                    .map(|url| json!({ "href": url }))
            }
            ProbeTarget::OrganizedToggle => scene.organized.then(|| json!({ "organized": true })),
        };
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ApiSurface;
    use crate::config::{ApiConfig, ProvidersConfig};
    use crate::model::{Provider, ScrapeResult};
    use crate::query::QueryClient;
    use crate::surface::{ProbeTarget, SceneSurface};
    use crate::test_support::{scene_json, FakeTransport, THEPORNDB_ENDPOINT};

    fn surface(transport: &Arc<FakeTransport>) -> ApiSurface {
        let client = Arc::new(QueryClient::new(transport.clone(), &ApiConfig::default()));
        ApiSurface::new(client, ProvidersConfig::default())
    }

    #[tokio::test]
    async fn test_scrape_decodes_first_result_and_uses_stash_box_source() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond_to(
            "scrapeSingleScene",
            json!({"scrapeSingleScene": [{
                "title": "Scene",
                "date": "2024-02-03",
                "urls": null,
                "remote_site_id": "remote-1",
                "studio": {"name": "Studio", "stored_id": null},
                "performers": [{"name": "P", "stored_id": "9"}],
                "tags": []
            }]}),
        );
        let result = surface(&transport)
            .scrape("1", Provider::StashDb)
            .await
            .expect("scrape");

        let ScrapeResult::Matched(scraped) = result else {
            panic!("expected a match");
        };
        assert_eq!(scraped.title.as_deref(), Some("Scene"));
        assert!(scraped.urls.is_empty());
        assert_eq!(scraped.missing_entities(), 1);
        let (_, variables) = transport.last_request("scrapeSingleScene").expect("request");
        assert_eq!(
            variables["source"]["stash_box_endpoint"],
            "https://stashdb.org/graphql"
        );
    }

    #[tokio::test]
    async fn test_empty_scrape_result_is_no_match() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond_to("scrapeSingleScene", json!({"scrapeSingleScene": []}));
        let result = surface(&transport)
            .scrape("1", Provider::ThePornDb)
            .await
            .expect("scrape");
        assert_eq!(result, ScrapeResult::NoMatch);
    }

    #[tokio::test]
    async fn test_apply_merges_ids_and_adds_stash_id() {
        let transport = Arc::new(FakeTransport::default());
        let mut scene = scene_json("1", &[]);
        scene["performers"] = json!([{"id": "1", "name": "Existing"}]);
        transport.insert_scene(scene);
        transport.respond_to("sceneUpdate", json!({"sceneUpdate": {"id": "1"}}));
        let scraped = crate::test_support::full_match("A");

        let fields = surface(&transport)
            .apply("1", Provider::StashDb, &crate::test_support::with_stored_ids(scraped))
            .await
            .expect("apply");

        assert!(fields.contains(&"title".to_string()));
        assert!(fields.contains(&"stash_ids".to_string()));
        let (_, variables) = transport.last_request("sceneUpdate").expect("update");
        let input = &variables["input"];
        assert_eq!(input["performer_ids"][0], "1");
        assert_eq!(input["stash_ids"][0]["endpoint"], "https://stashdb.org/graphql");
        assert_eq!(input["stash_ids"][0]["stash_id"], "remote-A");
    }

    #[tokio::test]
    async fn test_create_linked_entities_fills_missing_ids() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond_to("performerCreate", json!({"performerCreate": {"id": "p-new"}}));
        transport.respond_to("studioCreate", json!({"studioCreate": {"id": "s-new"}}));
        transport.respond_to("tagCreate", json!({"tagCreate": {"id": "t-new"}}));
        let scraped = crate::test_support::full_match("A");

        let updated = surface(&transport)
            .create_linked_entities("1", &scraped)
            .await
            .expect("create");

        assert_eq!(updated.missing_entities(), 0);
        assert_eq!(
            updated.studio.and_then(|studio| studio.stored_id).as_deref(),
            Some("s-new")
        );
    }

    #[tokio::test]
    async fn test_probe_reads_identifiers_and_links_from_snapshot() {
        let transport = Arc::new(FakeTransport::default());
        let mut scene = scene_json("2", &[THEPORNDB_ENDPOINT]);
        scene["urls"] = json!(["https://StashDB.org/scenes/abc"]);
        transport.insert_scene(scene);
        let surface = surface(&transport);

        let identifier = surface
            .probe("2", ProbeTarget::ProviderIdentifier(Provider::ThePornDb))
            .await
            .expect("probe");
        assert_eq!(identifier, Some(json!({"stashId": "remote-2-0"})));
        assert!(surface
            .probe("2", ProbeTarget::ProviderIdentifier(Provider::StashDb))
            .await
            .expect("probe")
            .is_none());
        assert!(surface
            .probe("2", ProbeTarget::ProviderLink(Provider::StashDb))
            .await
            .expect("probe")
            .is_some());
        assert_eq!(transport.find_scene_calls(), 1);
    }

    #[tokio::test]
    async fn test_mark_organized_invalidates_cached_scene() {
        let transport = Arc::new(FakeTransport::default());
        transport.insert_scene(scene_json("1", &[]));
        transport.respond_to("sceneUpdate", json!({"sceneUpdate": {"id": "1"}}));
        let surface = surface(&transport);

        assert!(surface
            .probe("1", ProbeTarget::OrganizedToggle)
            .await
            .expect("probe")
            .is_none());
        let mut organized = scene_json("1", &[]);
        organized["organized"] = json!(true);
        transport.insert_scene(organized);
        surface.mark_organized("1").await.expect("organize");
        assert!(surface
            .probe("1", ProbeTarget::OrganizedToggle)
            .await
            .expect("probe")
            .is_some());
    }
}
