//! Application configuration management.
//!
//! Holds the storefront base URL, where session tokens are kept, the request
//! timeout and the last used username.
//!
//! Configuration is stored at `~/.config/medcart/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::transport::REQUEST_TIMEOUT_SECS;
use crate::api::HttpTransport;
use crate::auth::{FileStorage, KeyringStorage, SecureStorage, SessionManager};

/// Application name used for config/data directory paths
const APP_NAME: &str = "medcart";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Storefront API used when nothing is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Overrides `api_base_url`
pub const API_URL_ENV: &str = "MEDCART_API_URL";

/// Where the token pair is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// OS keychain
    #[default]
    Keyring,
    /// `session.json` in the app data directory
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub storage: StorageBackend,
    pub request_timeout_secs: Option<u64>,
    pub last_username: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
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
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Base URL, with `MEDCART_API_URL` taking precedence over the file.
    pub fn api_base_url(&self) -> String {
        self.resolve_api_url(std::env::var(API_URL_ENV).ok())
    }

    fn resolve_api_url(&self, env_override: Option<String>) -> String {
        env_override
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn build_storage(&self) -> Result<Arc<dyn SecureStorage>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringStorage::default()),
            StorageBackend::File => Arc::new(FileStorage::new(self.data_dir()?)),
        })
    }

    /// Wire a session manager from this configuration.
    pub fn session_manager(&self) -> Result<Arc<SessionManager>> {
        let base_url = self.api_base_url();
        debug!(base_url = %base_url, storage = ?self.storage, "Building session manager");

        let transport = HttpTransport::with_timeout(base_url, self.request_timeout())
            .context("Failed to create HTTP client")?;
        let storage = self.build_storage()?;
        Ok(Arc::new(SessionManager::new(Arc::new(transport), storage)))
    }
}

// ============================================================================
// Tests
// ============================================================================
