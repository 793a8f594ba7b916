//! Configuration management for Schedule Core.
//!
//! This module handles loading and saving configuration to/from a JSON file
//! in a config directory. The config directory can be customized.
//!
//! Includes sync-related configuration:
//! - device_id: UUID7 identifying this device (generated on first run)
//! - device_token: credential presented on every sync and lock call
//! - server_url: base URL of the authoritative sync server
//! - sync: server, lock and conflict settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflicts::ConflictPolicy;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{new_id, DeviceSession};

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Note lock lifetime
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// How often the server clears stale note locks
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub lock_sweep_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// keep_server, keep_local, merge or surface
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: String,
}

fn default_server_port() -> u16 {
    8384
}

fn default_lock_timeout_secs() -> u64 {
    300
}

fn default_lock_sweep_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_conflict_policy() -> String {
    ConflictPolicy::Surface.as_str().to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_port: default_server_port(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_sweep_interval_secs: default_lock_sweep_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            conflict_policy: default_conflict_policy(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Device ID (UUID7 hex)
    #[serde(default = "new_id")]
    pub device_id: String,
    /// Human-readable device name
    #[serde(default = "get_default_device_name")]
    pub device_name: String,
    /// Credential issued to this device by the server administrator
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn get_default_device_name() -> String {
    #[cfg(feature = "desktop")]
    {
        match hostname::get() {
            Ok(name) => format!("Schedule on {}", name.to_string_lossy()),
            Err(_) => "Schedule Device".to_string(),
        }
    }
    #[cfg(not(feature = "desktop"))]
    {
        "Schedule Mobile".to_string()
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_id: new_id(),
            device_name: get_default_device_name(),
            device_token: None,
            server_url: None,
            sync: SyncConfig::default(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// On mobile platforms (without the `desktop` feature), `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> ScheduleResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("schedule")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(ScheduleError::Config(
                        "config_dir is required on mobile platforms".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let defaults = || ConfigData {
            database_file: config_dir.join("schedule.db").to_string_lossy().to_string(),
            ..ConfigData::default()
        };
        let data = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {}: {}", config_file.display(), e);
                defaults()
            }),
            Err(_) => defaults(),
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> ScheduleResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn device_id(&self) -> &str {
        &self.data.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.data.device_name
    }

    pub fn set_device_name(&mut self, name: &str) -> ScheduleResult<()> {
        self.data.device_name = name.to_string();
        self.save()
    }

    pub fn device_token(&self) -> Option<&str> {
        self.data.device_token.as_deref()
    }

    pub fn set_device_token(&mut self, token: &str) -> ScheduleResult<()> {
        self.data.device_token = Some(token.to_string());
        self.save()
    }

    pub fn server_url(&self) -> Option<&str> {
        self.data.server_url.as_deref()
    }

    pub fn set_server_url(&mut self, url: &str) -> ScheduleResult<()> {
        self.data.server_url = Some(url.trim_end_matches('/').to_string());
        self.save()
    }

    /// Credentials for sync calls. Fails when no token is configured.
    pub fn session(&self) -> ScheduleResult<DeviceSession> {
        let token = self
            .device_token()
            .ok_or_else(|| ScheduleError::Config("device_token is not set".to_string()))?;
        Ok(DeviceSession::new(self.device_id(), token))
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.data.sync.enabled
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) -> ScheduleResult<()> {
        self.data.sync.enabled = enabled;
        self.save()
    }

    pub fn sync_server_port(&self) -> u16 {
        self.data.sync.server_port
    }

    pub fn set_sync_server_port(&mut self, port: u16) -> ScheduleResult<()> {
        self.data.sync.server_port = port;
        self.save()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.data.sync.lock_timeout_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.data.sync.lock_sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.data.sync.request_timeout_secs)
    }

    /// Parsed client conflict policy
    pub fn conflict_policy(&self) -> ScheduleResult<ConflictPolicy> {
        ConflictPolicy::from_str(&self.data.sync.conflict_policy).ok_or_else(|| {
            ScheduleError::Config(format!(
                "Unknown conflict_policy: {}",
                self.data.sync.conflict_policy
            ))
        })
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "device_id" => Some(self.data.device_id.clone()),
            "device_name" => Some(self.data.device_name.clone()),
            "server_url" => self.data.server_url.clone(),
            "lock_timeout_secs" => Some(self.data.sync.lock_timeout_secs.to_string()),
            "conflict_policy" => Some(self.data.sync.conflict_policy.clone()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> ScheduleResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "device_name" => self.data.device_name = value.to_string(),
            "server_url" => self.data.server_url = Some(value.trim_end_matches('/').to_string()),
            "lock_timeout_secs" => {
                self.data.sync.lock_timeout_secs = value.parse().map_err(|_| {
                    ScheduleError::validation("lock_timeout_secs", "must be a whole number of seconds")
                })?
            }
            "conflict_policy" => {
                if ConflictPolicy::from_str(value).is_none() {
                    return Err(ScheduleError::validation("conflict_policy", "unknown policy"));
                }
                self.data.sync.conflict_policy = value.to_string()
            }
            _ => return Err(ScheduleError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert_eq!(config.device_id().len(), 32);
        assert!(!config.device_name().is_empty());
        assert!(!config.is_sync_enabled());
        assert_eq!(config.sync_server_port(), 8384);
        assert_eq!(config.lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.conflict_policy().unwrap(), ConflictPolicy::Surface);
        assert!(config.database_file().ends_with("schedule.db"));
        assert!(config.session().is_err());
    }

    #[test]
    fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let device_id;

        {
            let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            config.set_device_name("Front desk").unwrap();
            config.set_device_token("secret").unwrap();
            config.set_server_url("http://127.0.0.1:8384/").unwrap();
            config.set_sync_enabled(true).unwrap();
            device_id = config.device_id().to_string();
        }

        {
            let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            assert_eq!(config.device_name(), "Front desk");
            assert_eq!(config.device_id(), device_id);
            assert_eq!(config.server_url(), Some("http://127.0.0.1:8384"));
            assert!(config.is_sync_enabled());

            let session = config.session().unwrap();
            assert_eq!(session.device_id, device_id);
            assert_eq!(session.device_token, "secret");
        }
    }

    #[test]
    fn test_missing_sync_fields_take_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"database_file": "/tmp/x.db", "sync": {"enabled": true}}"#,
        )
        .unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.database_file(), "/tmp/x.db");
        assert!(config.is_sync_enabled());
        assert_eq!(config.sync_config().lock_sweep_interval_secs, 60);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_get_set() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.get("server_url").is_none());
        config.set("server_url", "https://sched.example.com").unwrap();
        assert_eq!(config.get("server_url"), Some("https://sched.example.com".to_string()));

        config.set("conflict_policy", "keep_server").unwrap();
        assert_eq!(config.conflict_policy().unwrap(), ConflictPolicy::KeepServer);
        assert!(config.set("conflict_policy", "coin_flip").is_err());

        config.set("lock_timeout_secs", "120").unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_secs(120));
        assert!(config.set("lock_timeout_secs", "soon").is_err());

        assert!(config.set("no_such_key", "x").is_err());
    }
}
