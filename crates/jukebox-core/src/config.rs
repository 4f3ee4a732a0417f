use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;
use crate::prefs::{PreferenceSource, Preferences};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub playback: Preferences,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Timeline checkpoint file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// One-line "now playing" file kept up to date by the daemon.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Fixed seed for the random future.  A fresh one is drawn per process
    /// when unset.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_enabled")]
    pub http_enabled: bool,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// TOML listing of `[[track]]` tables.
    #[serde(default = "default_catalog_file")]
    pub catalog_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Explicit mpv binary; searched beside the executable and on PATH otherwise.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            status_file: default_status_file(),
            shuffle_seed: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            http_enabled: default_http_enabled(),
            http_port: default_http_port(),
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            catalog_file: default_catalog_file(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            binary: None,
            volume: default_volume(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state")
}

fn default_status_file() -> PathBuf {
    platform::data_dir().join("now-playing")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8990
}

fn default_catalog_file() -> PathBuf {
    platform::config_dir().join("library.toml")
}

fn default_volume() -> f32 {
    0.5
}

impl Config {
    /// Load from the default location, writing defaults there on first run.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

/// Re-reads `[playback]` from a config file on every `PreferenceChanged`.
pub struct ConfigFilePreferences {
    path: PathBuf,
}

impl ConfigFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceSource for ConfigFilePreferences {
    fn load(&mut self) -> anyhow::Result<Preferences> {
        Ok(Config::load_from(&self.path)?.playback)
    }
}
