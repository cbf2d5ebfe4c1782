//! Stored agent credentials
//!
//! Keeps the bearer token (and the last tunnel started from this machine) in
//! `~/.tunnlr/config.json` so the CLI does not need the token on every run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of the stored config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    /// Default authentication token for tunnel connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Id of the last tunnel established, used by `stop` when no id is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tunnel_id: Option<String>,
}

/// File-backed token storage
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The per-user store at `~/.tunnlr/config.json`
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::new(home.join(".tunnlr").join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored config; a missing file is an empty config
    pub fn load(&self) -> Result<StoredConfig> {
        if !self.path.exists() {
            return Ok(StoredConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file: {:?}", self.path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", self.path))
    }

    pub fn save(&self, config: &StoredConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write config file: {:?}", self.path))
    }

    pub fn token(&self) -> Result<Option<String>> {
        Ok(self.load()?.auth_token)
    }

    pub fn set_token(&self, token: impl Into<String>) -> Result<()> {
        let mut config = self.load()?;
        config.auth_token = Some(token.into());
        self.save(&config)
    }

    /// Forget the token; the last tunnel id is forgotten with it
    pub fn clear(&self) -> Result<()> {
        self.save(&StoredConfig::default())
    }

    pub fn last_tunnel_id(&self) -> Result<Option<String>> {
        Ok(self.load()?.last_tunnel_id)
    }

    pub fn set_last_tunnel_id(&self, tunnel_id: impl Into<String>) -> Result<()> {
        let mut config = self.load()?;
        config.last_tunnel_id = Some(tunnel_id.into());
        self.save(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("nested").join("config.json"))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.load().unwrap(), StoredConfig::default());
        assert!(store.token().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_token() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set_token("tok-123").unwrap();
        store.set_last_tunnel_id("t-9").unwrap();

        assert_eq!(store.token().unwrap().as_deref(), Some("tok-123"));
        assert_eq!(store.last_tunnel_id().unwrap().as_deref(), Some("t-9"));
        assert!(store.path().exists());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set_token("tok-123").unwrap();
        store.clear().unwrap();

        assert!(store.token().unwrap().is_none());
        assert!(store.last_tunnel_id().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
