//! Typed access to the external application's GraphQL query API.

pub mod client;
pub mod queries;
pub mod transport;

pub use client::QueryClient;
pub use queries::{find_scene, invalidate_scene, scene_cache_key, FIND_SCENE};
pub use transport::{HttpTransport, QueryTransport};
