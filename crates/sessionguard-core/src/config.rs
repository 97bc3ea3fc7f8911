//! Session configuration management.
//!
//! Holds the identity-provider endpoints, the expiring-soon threshold, call
//! timeouts and where credentials are persisted.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json`. Any field
//! may be overridden through `SESSIONGUARD_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::AuthEndpoints;
use crate::auth::backend::{
    FileBackend, KeyringBackend, MemoryBackend, StorageBackend, KEYRING_SERVICE,
};
use crate::auth::expiry::{self, DEFAULT_EXPIRING_SOON_THRESHOLD_SECS};

/// Application name used for config/storage directory paths
const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Prefix of environment overrides, e.g. `SESSIONGUARD_REFRESH_URL`.
const ENV_PREFIX: &str = "SESSIONGUARD_";

const DEFAULT_LOGIN_URL: &str = "http://localhost:8080/api/auth/login";
const DEFAULT_REFRESH_URL: &str = "http://localhost:8080/api/auth/refresh";
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Where the credential, claims and capabilities are kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => anyhow::bail!("Unknown storage kind: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub login_url: String,
    pub refresh_url: String,
    pub revoke_url: Option<String>,
    pub authorities_url: Option<String>,
    /// Window before expiry in which a credential is refreshed proactively.
    /// Must be shorter than the lifetime of issued credentials, otherwise
    /// every request triggers a refresh.
    pub expiring_soon_threshold_seconds: u64,
    pub refresh_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub storage: StorageKind,
    pub storage_dir: Option<PathBuf>,
    pub last_username: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            refresh_url: DEFAULT_REFRESH_URL.to_string(),
            revoke_url: None,
            authorities_url: None,
            expiring_soon_threshold_seconds: DEFAULT_EXPIRING_SOON_THRESHOLD_SECS,
            refresh_timeout_seconds: DEFAULT_REFRESH_TIMEOUT_SECS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageKind::default(),
            storage_dir: None,
            last_username: None,
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
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

    /// Apply `SESSIONGUARD_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let seconds = |name: &str, value: String| -> Result<u64> {
            value
                .trim()
                .parse()
                .with_context(|| format!("{}{} must be a whole number of seconds", ENV_PREFIX, name))
        };

        if let Some(v) = lookup("LOGIN_URL") {
            self.login_url = v;
        }
        if let Some(v) = lookup("REFRESH_URL") {
            self.refresh_url = v;
        }
        if let Some(v) = lookup("REVOKE_URL") {
            self.revoke_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("AUTHORITIES_URL") {
            self.authorities_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("EXPIRING_SOON_THRESHOLD_SECONDS") {
            self.expiring_soon_threshold_seconds = seconds("EXPIRING_SOON_THRESHOLD_SECONDS", v)?;
        }
        if let Some(v) = lookup("REFRESH_TIMEOUT_SECONDS") {
            self.refresh_timeout_seconds = seconds("REFRESH_TIMEOUT_SECONDS", v)?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECONDS") {
            self.request_timeout_seconds = seconds("REQUEST_TIMEOUT_SECONDS", v)?;
        }
        if let Some(v) = lookup("STORAGE") {
            self.storage = v.parse()?;
        }
        if let Some(v) = lookup("STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    pub fn endpoints(&self) -> AuthEndpoints {
        AuthEndpoints {
            login_url: self.login_url.clone(),
            refresh_url: self.refresh_url.clone(),
            revoke_url: self.revoke_url.clone(),
            authorities_url: self.authorities_url.clone(),
        }
    }

    pub fn threshold(&self) -> chrono::Duration {
        expiry::threshold_from_secs(self.expiring_soon_threshold_seconds)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn storage_backend(&self) -> Result<Box<dyn StorageBackend>> {
        debug!(storage = ?self.storage, "Opening credential storage");
        Ok(match self.storage {
            StorageKind::File => Box::new(FileBackend::new(self.storage_dir()?)?),
            StorageKind::Keyring => Box::new(KeyringBackend::new(KEYRING_SERVICE)),
            StorageKind::Memory => Box::new(MemoryBackend::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.expiring_soon_threshold_seconds, 300);
        assert_eq!(config.threshold(), chrono::Duration::seconds(300));
        assert_eq!(config.refresh_timeout(), Duration::from_secs(15));
        assert_eq!(config.storage, StorageKind::File);
        assert!(config.revoke_url.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{"refresh_url": "https://idp.example.com/refresh", "storage": "keyring"}"#;
        let config: SessionConfig = serde_json::from_str(json).expect("config");

        assert_eq!(config.refresh_url, "https://idp.example.com/refresh");
        assert_eq!(config.login_url, DEFAULT_LOGIN_URL);
        assert_eq!(config.storage, StorageKind::Keyring);
        assert_eq!(config.request_timeout_seconds, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_env_overrides() {
        let config = SessionConfig::default()
            .apply_overrides(lookup(&[
                ("REFRESH_URL", "https://idp.example.com/refresh"),
                ("REVOKE_URL", "https://idp.example.com/revoke"),
                ("EXPIRING_SOON_THRESHOLD_SECONDS", "60"),
                ("STORAGE", "Memory"),
            ]))
            .expect("overrides");

        assert_eq!(config.refresh_url, "https://idp.example.com/refresh");
        assert_eq!(config.revoke_url.as_deref(), Some("https://idp.example.com/revoke"));
        assert_eq!(config.threshold(), chrono::Duration::seconds(60));
        assert_eq!(config.storage, StorageKind::Memory);
    }

    #[test]
    fn test_env_override_rejects_bad_numbers() {
        let result = SessionConfig::default()
            .apply_overrides(lookup(&[("REFRESH_TIMEOUT_SECONDS", "soon")]));
        assert!(result.is_err());

        let result = SessionConfig::default().apply_overrides(lookup(&[("STORAGE", "cloud")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_timeouts_are_clamped() {
        let config = SessionConfig {
            refresh_timeout_seconds: 0,
            request_timeout_seconds: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.refresh_timeout(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_file_storage_uses_configured_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..SessionConfig::default()
        };

        assert_eq!(config.storage_dir().expect("dir"), dir.path());
        let backend = config.storage_backend().expect("backend");
        backend.write("credential", "\"a.b.c\"").expect("write");
        assert_eq!(
            backend.read("credential").expect("read").as_deref(),
            Some("\"a.b.c\"")
        );
    }
}
