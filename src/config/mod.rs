//! Configuration management for the Outpost gateway
//!
//! Sources, highest priority first: environment (`OUTPOST_*`), the TOML
//! config file, built-in defaults. CLI flags are applied on top by the
//! binary.

pub mod file;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::correlator::RequestKind;
use crate::presence::DEFAULT_WINDOW;
use crate::relay::RelayOptions;
use crate::store::FirebaseConfig;
use crate::{Error, Result};

use file::OutpostConfigFile;

/// Default API port
pub const DEFAULT_PORT: u16 = 3000;

/// Outpost gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API server configuration
    pub server: ServerConfig,

    /// Shared store backend
    pub store: StoreConfig,

    /// How long a device stays online after its last heartbeat
    pub presence_window: Duration,

    /// Live frame relay tuning
    pub relay: RelayOptions,

    /// Per-kind wait window overrides
    pub timeouts: HashMap<RequestKind, Duration>,

    /// Reject requests for devices missing from the presence registry
    pub require_known_device: bool,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Requests per minute across all clients; `None` disables throttling
    pub rate_limit_per_minute: Option<u32>,
}

/// Shared store selection
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// In-process store; state is lost on restart
    Memory,
    /// Firebase Realtime Database
    Firebase(FirebaseConfig),
}

impl StoreConfig {
    /// Backend name
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Firebase(_) => "firebase",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                rate_limit_per_minute: None,
            },
            store: StoreConfig::Memory,
            presence_window: DEFAULT_WINDOW,
            relay: RelayOptions::default(),
            timeouts: HashMap::new(),
            require_known_device: false,
        }
    }
}

impl Config {
    /// Load configuration from the default config file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a setting is malformed or the store settings are incomplete
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit config file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or a setting is invalid
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::resolve(file::load_from_path(path)?, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with environment lookups (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a setting is malformed or the store settings are incomplete
    pub fn resolve(fc: OutpostConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let server = ServerConfig {
            host: env("OUTPOST_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: parse_env(&env, "OUTPOST_PORT")?
                .or(parse_env(&env, "PORT")?)
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            rate_limit_per_minute: parse_env(&env, "OUTPOST_RATE_LIMIT")?
                .or(fc.server.rate_limit_per_minute)
                .filter(|n| *n > 0),
        };

        let backend = env("OUTPOST_STORE")
            .or(fc.store.backend)
            .unwrap_or_else(|| "memory".to_string());
        let store = match backend.to_lowercase().as_str() {
            "memory" => StoreConfig::Memory,
            "firebase" => {
                let database_url = env("OUTPOST_FIREBASE_URL")
                    .or(fc.store.firebase_url)
                    .ok_or_else(|| {
                        Error::Config("firebase store needs OUTPOST_FIREBASE_URL".to_string())
                    })?;
                StoreConfig::Firebase(FirebaseConfig {
                    database_url,
                    auth_token: env("OUTPOST_FIREBASE_TOKEN").or(fc.store.firebase_auth_token),
                })
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown store backend '{other}' (expected memory or firebase)"
                )));
            }
        };

        let presence_window = parse_env(&env, "OUTPOST_PRESENCE_WINDOW_SECS")?
            .or(fc.presence.window_secs)
            .map_or(defaults.presence_window, Duration::from_secs);

        let relay = RelayOptions {
            frame_interval: parse_env(&env, "OUTPOST_FRAME_INTERVAL_MS")?
                .or(fc.relay.frame_interval_ms)
                .map_or(defaults.relay.frame_interval, Duration::from_millis),
            viewer_capacity: parse_env(&env, "OUTPOST_VIEWER_CAPACITY")?
                .or(fc.relay.viewer_capacity)
                .unwrap_or(defaults.relay.viewer_capacity),
        };
        if relay.frame_interval.is_zero() {
            return Err(Error::Config("frame interval must be positive".to_string()));
        }
        if relay.viewer_capacity == 0 {
            return Err(Error::Config("viewer capacity must be positive".to_string()));
        }

        // File entries first so the environment wins per kind
        let mut timeouts = HashMap::new();
        for (name, ms) in fc.requests.timeouts_ms {
            let kind = name
                .parse::<RequestKind>()
                .map_err(|_| Error::Config(format!("unknown request kind '{name}' in timeouts")))?;
            timeouts.insert(kind, Duration::from_millis(ms));
        }
        for kind in RequestKind::ALL {
            let key = format!("OUTPOST_TIMEOUT_{}_MS", kind.as_str().to_uppercase());
            if let Some(ms) = parse_env::<u64>(&env, &key)? {
                timeouts.insert(kind, Duration::from_millis(ms));
            }
        }
        if let Some((kind, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::Config(format!("timeout for {kind} must be positive")));
        }

        let require_known_device = env("OUTPOST_REQUIRE_KNOWN_DEVICE")
            .map(|v| v == "true" || v == "1")
            .or(fc.requests.require_known_device)
            .unwrap_or(defaults.require_known_device);

        Ok(Self {
            server,
            store,
            presence_window,
            relay,
            timeouts,
            require_known_device,
        })
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}: {e}")))
        })
        .transpose()
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "listen              {}:{}", self.server.host, self.server.port)?;
        match self.server.rate_limit_per_minute {
            Some(n) => writeln!(f, "rate limit          {n}/min")?,
            None => writeln!(f, "rate limit          off")?,
        }
        writeln!(f, "store               {}", self.store.backend())?;
        if let StoreConfig::Firebase(firebase) = &self.store {
            writeln!(f, "  database url      {}", firebase.database_url)?;
            let token = if firebase.auth_token.is_some() { "set" } else { "none" };
            writeln!(f, "  auth token        {token}")?;
        }
        writeln!(f, "presence window     {}s", self.presence_window.as_secs())?;
        writeln!(f, "frame interval      {}ms", self.relay.frame_interval.as_millis())?;
        writeln!(f, "viewer capacity     {}", self.relay.viewer_capacity)?;
        writeln!(f, "known devices only  {}", self.require_known_device)?;
        for kind in RequestKind::ALL {
            let timeout = self.timeouts.get(&kind).copied().unwrap_or_else(|| kind.default_timeout());
            writeln!(f, "timeout {:<12}{}ms", kind.as_str(), timeout.as_millis())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::resolve(OutpostConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(matches!(config.store, StoreConfig::Memory));
        assert_eq!(config.presence_window, Duration::from_secs(120));
        assert_eq!(config.relay.frame_interval, Duration::from_millis(500));
        assert!(config.timeouts.is_empty());
        assert!(!config.require_known_device);
    }

    #[test]
    fn env_overrides_file() {
        let fc: OutpostConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            [requests.timeouts_ms]
            cmd = 30000
            sms = 5000
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            fc,
            env_of(&[("OUTPOST_PORT", "9100"), ("OUTPOST_TIMEOUT_CMD_MS", "40000")]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.timeouts[&RequestKind::Cmd], Duration::from_secs(40));
        assert_eq!(config.timeouts[&RequestKind::Sms], Duration::from_secs(5));
    }

    #[test]
    fn firebase_requires_url() {
        let err = Config::resolve(OutpostConfigFile::default(), env_of(&[("OUTPOST_STORE", "firebase")]));
        assert!(matches!(err, Err(Error::Config(_))));

        let config = Config::resolve(
            OutpostConfigFile::default(),
            env_of(&[
                ("OUTPOST_STORE", "firebase"),
                ("OUTPOST_FIREBASE_URL", "https://demo.firebaseio.com"),
                ("OUTPOST_FIREBASE_TOKEN", "secret"),
            ]),
        )
        .unwrap();
        let StoreConfig::Firebase(firebase) = &config.store else {
            panic!("expected firebase store");
        };
        assert_eq!(firebase.auth_token.as_deref(), Some("secret"));
        assert!(!config.to_string().contains("secret"));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        for pairs in [
            [("OUTPOST_PORT", "not-a-port")],
            [("OUTPOST_STORE", "redis")],
            [("OUTPOST_VIEWER_CAPACITY", "0")],
            [("OUTPOST_TIMEOUT_SMS_MS", "0")],
        ] {
            assert!(
                matches!(Config::resolve(OutpostConfigFile::default(), env_of(&pairs)), Err(Error::Config(_))),
                "{pairs:?} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_timeout_kind_in_file_is_rejected() {
        let fc: OutpostConfigFile = toml::from_str("[requests.timeouts_ms]\nfax = 1000\n").unwrap();
        assert!(matches!(Config::resolve(fc, env_of(&[])), Err(Error::Config(_))));
    }
}
