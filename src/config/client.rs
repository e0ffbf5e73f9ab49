use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::Table;

pub const API_KEY_ENV: &str = "ROSTERSYNC_API_KEY";
pub const BASE_URL_ENV: &str = "ROSTERSYNC_BASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the remote service (e.g., "https://roster.example.com").
    pub base_url: String,
    pub api_key: String,
    /// Realtime endpoint. Derived from `base_url` when unset.
    pub realtime_url: Option<String>,
    pub data_dir: PathBuf,
    /// Stable identifier produced by the login handshake.
    pub principal_id: Option<String>,
    pub poll_interval_secs: u64,
    pub full_resync_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub realtime_tables: Vec<Table>,
    pub realtime_max_attempts: u32,
    pub realtime_base_delay_secs: u64,
    pub realtime_max_delay_secs: u64,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
    pub encrypt_cache: bool,
    pub summary_recent_limit: usize,
    pub recent_audit_window_days: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            api_key: String::new(),
            realtime_url: None,
            data_dir: PathBuf::from("./data"),
            principal_id: None,
            poll_interval_secs: 1,
            full_resync_interval_secs: 300,
            request_timeout_secs: 30,
            download_timeout_secs: 120,
            realtime_tables: vec![
                Table::Principals,
                Table::Permissions,
                Table::Roster,
                Table::SyncMetadata,
            ],
            realtime_max_attempts: 6,
            realtime_base_delay_secs: 1,
            realtime_max_delay_secs: 60,
            dispatch_workers: 2,
            dispatch_queue: 64,
            encrypt_cache: true,
            summary_recent_limit: 50,
            recent_audit_window_days: 30,
        }
    }
}

impl ClientConfig {
    /// Loads a TOML config file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.api_key = key;
            }
        }
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.is_empty() {
                self.base_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("base_url cannot be empty".to_string()));
        }
        if self.poll_interval_secs == 0 || self.full_resync_interval_secs == 0 {
            return Err(Error::Config("sync intervals must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        if self.dispatch_workers == 0 || self.dispatch_queue == 0 {
            return Err(Error::Config(
                "dispatch_workers and dispatch_queue must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/realtime/v1/websocket")
    }

    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(".cache_key")
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn full_resync_interval(&self) -> Duration {
        Duration::from_secs(self.full_resync_interval_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
