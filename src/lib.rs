//! Metadata-enrichment automation for scenes held by a Stash-style content
//! manager: detection of already-scraped providers, scraping through an
//! abstract surface, and the bookkeeping around each run.

pub mod api_surface;
pub mod app_context;
pub mod cancel;
pub mod config;
pub mod config_persistence;
pub mod credentials;
pub mod db_manager;
pub mod detection;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod notify;
pub mod prompt;
pub mod protocol;
pub mod query;
pub mod rescrape_queue;
pub mod routing;
pub mod scoring;
pub mod source_stats;
pub mod status;
pub mod surface;

#[cfg(test)]
mod test_support;
