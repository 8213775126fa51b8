//! Loading and comment-preserving persistence of `autoscrape.toml`.

use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{DocumentMut, Item, Table, Value};

use crate::config::{sanitize_config, Config};
use crate::error::ConfigError;

const CONFIG_DIR_NAME: &str = "autoscrape";
const CONFIG_FILE_NAME: &str = "autoscrape.toml";

/// Default location: `<config dir>/autoscrape/autoscrape.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    Some(
        dirs::config_dir()?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME),
    )
}

fn bare_text(value: &Value) -> String {
    let mut bare = value.clone();
    bare.decor_mut().clear();
    bare.to_string()
}

/// Copies `next` into `existing`. Changed values keep the comments around
/// them; keys only present in `existing` are left alone.
fn merge_keeping_comments(existing: &mut Table, next: &Table) {
    for (key, next_item) in next.iter() {
        if let Item::Table(next_table) = next_item {
            let slot = existing.entry(key).or_insert(Item::Table(Table::new()));
            if !slot.is_table() {
                *slot = Item::Table(Table::new());
            }
            if let Some(table) = slot.as_table_mut() {
                merge_keeping_comments(table, next_table);
            }
            continue;
        }
        match (
            existing.get_mut(key).and_then(Item::as_value_mut),
            next_item.as_value(),
        ) {
            (Some(current), Some(next_value)) => {
                if bare_text(current) != bare_text(next_value) {
                    let decor = current.decor().clone();
                    *current = next_value.clone();
                    *current.decor_mut() = decor;
                }
            }
            _ => {
                existing.insert(key, next_item.clone());
            }
        }
    }
}

/// Renders `config` on top of the text of an existing config file.
pub fn merge_config_text(existing_text: &str, config: &Config) -> Result<String, ConfigError> {
    let next = toml::to_string(config)?.parse::<DocumentMut>()?;
    let mut document = existing_text.parse::<DocumentMut>()?;
    merge_keeping_comments(document.as_table_mut(), next.as_table());
    Ok(document.to_string())
}

/// Writes `config` to `path`. An existing file keeps its comments unless it
/// is not valid TOML, in which case it is replaced.
pub fn persist_config_file(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(existing) => match merge_config_text(&existing, config) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    "Could not merge into config {} ({}). Rewriting it.",
                    path.display(),
                    err
                );
                toml::to_string(config)?
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => toml::to_string(config)?,
        Err(err) => return Err(err.into()),
    };
    std::fs::write(path, text)?;
    Ok(())
}

/// Loads and sanitizes the config at `path`, creating it from defaults when
/// missing. Parse failures fall back to defaults without touching the file.
pub fn load_config_file(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(
                "Config file not found. Creating default config. path={}",
                path.display()
            );
            let config = Config::default();
            if let Err(err) = persist_config_file(&config, path) {
                warn!("Failed to write default config {}: {}", path.display(), err);
            }
            return config;
        }
        Err(err) => {
            warn!(
                "Failed to read config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            return Config::default();
        }
    };

    match toml::from_str::<Config>(&content) {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    }
}
