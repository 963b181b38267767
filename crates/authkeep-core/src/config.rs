//! Application configuration management.
//!
//! This module handles loading and saving the configuration: where the
//! backend lives, which endpoint paths it exposes, how credentials are stored
//! and how much clock skew to tolerate when checking expiry.
//!
//! Configuration is stored at `~/.config/authkeep/config.json`. A few fields
//! can be overridden from the environment (see [`Config::with_env_overrides`]).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "authkeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// HTTP request timeout in seconds.
/// Also bounds how long a hung renewal exchange can block its waiters.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_BASE_URL: &str = "AUTHKEEP_BASE_URL";
pub const ENV_STORE: &str = "AUTHKEEP_STORE";
pub const ENV_CLOCK_SKEW_MS: &str = "AUTHKEEP_CLOCK_SKEW_MS";

/// Where the credential pair is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process memory only
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StoreBackend::File),
            "keyring" => Ok(StoreBackend::Keyring),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown credential store: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub register_path: String,
    pub profile_path: String,
    /// Treat access credentials as expired this many milliseconds early
    pub clock_skew_tolerance_ms: i64,
    pub request_timeout_secs: u64,
    pub store: StoreBackend,
    /// Directory for the file store; defaults to the platform cache dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            login_path: "/user/login/".to_string(),
            refresh_path: "/user/refresh/".to_string(),
            register_path: "/user/register/".to_string(),
            profile_path: "/user/profile/".to_string(),
            clock_skew_tolerance_ms: 0,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            store: StoreBackend::default(),
            cache_dir: None,
            last_username: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let mut config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            if config.clock_skew_tolerance_ms < 0 {
                warn!(
                    value = config.clock_skew_tolerance_ms,
                    "Negative clock_skew_tolerance_ms in config, using 0"
                );
                config.clock_skew_tolerance_ms = 0;
            }
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `AUTHKEEP_*` environment variables on top of the file config.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = url;
        }
        if let Some(store) = lookup(ENV_STORE) {
            match store.parse() {
                Ok(store) => self.store = store,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORE),
            }
        }
        if let Some(skew) = lookup(ENV_CLOCK_SKEW_MS) {
            match skew.trim().parse::<i64>() {
                Ok(ms) if ms >= 0 => self.clock_skew_tolerance_ms = ms,
                _ => warn!(value = %skew, "Ignoring invalid {}", ENV_CLOCK_SKEW_MS),
            }
        }
        self
    }

    /// Absolute URL of an endpoint path on the backend
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.clock_skew_tolerance_ms, 0);
        assert_eq!(config.store, StoreBackend::File);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            base_url: "https://api.example.com".to_string(),
            store: StoreBackend::Keyring,
            last_username: Some("alice".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"base_url":"http://backend","store":"memory"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "http://backend");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.refresh_path, "/user/refresh/");
    }

    #[test]
    fn test_negative_skew_in_file_is_clamped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"clock_skew_tolerance_ms":-9223372036854775808}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.clock_skew_tolerance_ms, 0);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://override:9000"),
            (ENV_STORE, "Keyring"),
            (ENV_CLOCK_SKEW_MS, "1500"),
        ]
        .into_iter()
        .collect();
        let config = Config::default().with_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.base_url, "http://override:9000");
        assert_eq!(config.store, StoreBackend::Keyring);
        assert_eq!(config.clock_skew_tolerance_ms, 1500);
    }

    #[test]
    fn test_invalid_env_overrides_are_ignored() {
        let env: HashMap<&str, &str> =
            [(ENV_STORE, "floppy"), (ENV_CLOCK_SKEW_MS, "-5")].into_iter().collect();
        let config = Config::default().with_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        let config = Config {
            base_url: "http://host:8000/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.endpoint("/user/login/"), "http://host:8000/user/login/");
        assert_eq!(config.endpoint("user/refresh/"), "http://host:8000/user/refresh/");
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let config = Config {
            cache_dir: Some(PathBuf::from("/tmp/authkeep-test")),
            ..Config::default()
        };
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/authkeep-test"));
    }
}
