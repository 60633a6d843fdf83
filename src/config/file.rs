//! TOML configuration file loading
//!
//! Supports `~/.config/outpost/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutpostConfigFile {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Shared store backend
    #[serde(default)]
    pub store: StoreFileConfig,

    /// Presence registry
    #[serde(default)]
    pub presence: PresenceFileConfig,

    /// Live frame relay
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Device request waits
    #[serde(default)]
    pub requests: RequestsFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Address to bind
    pub host: Option<String>,

    /// Requests per minute across all clients before throttling
    pub rate_limit_per_minute: Option<u32>,
}

/// Shared store configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreFileConfig {
    /// `memory` or `firebase`
    pub backend: Option<String>,

    /// Realtime Database URL (e.g. `https://my-app-default-rtdb.firebaseio.com`)
    pub firebase_url: Option<String>,

    /// Database secret or ID token
    pub firebase_auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceFileConfig {
    pub window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayFileConfig {
    pub frame_interval_ms: Option<u64>,
    pub viewer_capacity: Option<usize>,
}

/// Request wait configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestsFileConfig {
    /// Reject requests for devices that never registered
    pub require_known_device: Option<bool>,

    /// Per-kind wait windows in milliseconds, keyed by kind name
    #[serde(default)]
    pub timeouts_ms: HashMap<String, u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `OutpostConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> OutpostConfigFile {
    let Some(path) = config_file_path() else {
        return OutpostConfigFile::default();
    };

    if !path.exists() {
        return OutpostConfigFile::default();
    }

    match load_from_path(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            OutpostConfigFile::default()
        }
    }
}

/// Load a TOML config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_from_path(path: &Path) -> Result<OutpostConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/outpost/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("outpost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let parsed: OutpostConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [store]
            backend = "firebase"
            firebase_url = "https://demo.firebaseio.com"

            [requests.timeouts_ms]
            installApk = 90000
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.port, Some(9000));
        assert_eq!(parsed.store.backend.as_deref(), Some("firebase"));
        assert_eq!(parsed.requests.timeouts_ms.get("installApk"), Some(&90_000));
        assert!(parsed.relay.viewer_capacity.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<OutpostConfigFile>("[server]\nprot = 1\n").is_err());
    }
}
