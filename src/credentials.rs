//! Credential-storage helpers for the query API access key.

use keyring::Entry;
use log::debug;

const API_KEY_SERVICE_NAME: &str = "autoscrape.api";
/// Environment override checked before the OS keyring.
pub const API_KEY_ENV_VAR: &str = "AUTOSCRAPE_API_KEY";

fn api_key_entry(endpoint: &str) -> Result<Entry, String> {
    Entry::new(API_KEY_SERVICE_NAME, endpoint)
        .map_err(|err| format!("failed to create keyring entry for endpoint '{endpoint}': {err}"))
}

fn keyring_error_hint(error: &str) -> Option<String> {
    if error.contains("org.freedesktop.DBus.Error.ServiceUnknown") {
        return Some(
            "no Secret Service provider is available. Start GNOME Keyring or KeePassXC Secret Service, or set AUTOSCRAPE_API_KEY."
                .to_string(),
        );
    }
    None
}

fn format_keyring_error(operation: &str, endpoint: &str, error: &str) -> String {
    let base = format!("{operation} failed in system keyring for endpoint '{endpoint}': {error}");
    match keyring_error_hint(error) {
        Some(hint) => format!("{base}. Hint: {hint}"),
        None => base,
    }
}

/// Saves the API key for an endpoint into the OS keyring.
pub fn set_api_key(endpoint: &str, api_key: &str) -> Result<(), String> {
    let entry = api_key_entry(endpoint)?;
    entry.set_password(api_key).map_err(|err| {
        let detail = format!("failed to set keyring password: {err}");
        format_keyring_error("save API key", endpoint, detail.as_str())
    })
}

/// Loads the API key for an endpoint from the OS keyring.
pub fn get_api_key(endpoint: &str) -> Result<Option<String>, String> {
    let entry = api_key_entry(endpoint)?;
    match entry.get_password() {
        Ok(api_key) => Ok(Some(api_key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => {
            let detail = format!("failed to get keyring password: {err}");
            Err(format_keyring_error(
                "load API key",
                endpoint,
                detail.as_str(),
            ))
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Resolves the API key: environment override first, then the keyring.
/// Keyring failures are logged and treated as "no key".
pub fn resolve_api_key(endpoint: &str) -> Option<String> {
    if let Some(api_key) = std::env::var(API_KEY_ENV_VAR).ok().and_then(non_blank) {
        return Some(api_key);
    }
    match get_api_key(endpoint) {
        Ok(api_key) => api_key.and_then(non_blank),
        Err(err) => {
            debug!("API key lookup skipped: {}", err);
            None
        }
    }
}
