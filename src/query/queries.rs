//! Query documents and record decoding.

use serde_json::{json, Value};

use crate::error::QueryError;
use crate::model::Scene;
use crate::query::client::QueryClient;

pub const FIND_SCENE: &str = r#"query FindScene($id: ID!) {
  findScene(id: $id) {
    id
    title
    organized
    urls
    details
    date
    stash_ids { endpoint stash_id }
    performers { id name }
    studio { id name }
    tags { id name }
    created_at
    updated_at
  }
}"#;

pub fn scene_cache_key(scene_id: &str) -> String {
    format!("scene:{scene_id}")
}

fn decode_scene(scene_id: &str, data: &Value) -> Result<Scene, QueryError> {
    match data.get("findScene") {
        None | Some(Value::Null) => Err(QueryError::Api(vec![format!(
            "scene {scene_id} not found"
        )])),
        Some(scene) => {
            serde_json::from_value(scene.clone()).map_err(|err| QueryError::Decode(err.to_string()))
        }
    }
}

/// Fetches one scene snapshot through the client's TTL cache.
pub async fn find_scene(client: &QueryClient, scene_id: &str) -> Result<Scene, QueryError> {
    let variables = json!({ "id": scene_id });
    let data = client
        .get_cached(&scene_cache_key(scene_id), client.default_ttl(), || {
            client.query(FIND_SCENE, variables)
        })
        .await?;
    decode_scene(scene_id, &data)
}

/// Drops the cached snapshot so the next fetch sees fresh data.
pub fn invalidate_scene(client: &QueryClient, scene_id: &str) {
    client.invalidate(&scene_cache_key(scene_id));
}
