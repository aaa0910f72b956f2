//! # Configuration Module
//!
//! Handles user configuration persistence and the background source setting.
//!
//! ## Configuration Storage
//! User preferences are stored as JSON in:
//! `~/.config/shell-background/config.json`
//!
//! The community background cache lives in the same directory (see `cache.rs`).
//!
//! ## Background Sources
//! A single string selects what is painted on the desktop:
//! - `inbuilt:<name>` - an SVG asset compiled into the binary
//! - `community` - a random wallpaper from the community feed, refreshed periodically
//! - anything else - a path to a local image file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Default source when nothing is configured
pub const DEFAULT_SOURCE: &str = "inbuilt:triangles";

/// Default community refresh interval (minutes)
pub const DEFAULT_WAIT_TIME: u32 = 30;

/// Default host serving the community background feed
pub const DEFAULT_FEED_BASE: &str = "https://vicr123.github.io";

/// Directory holding the config file and the community cache.
pub fn app_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("shell-background"))
}

/// What the desktop shows, parsed from the `background` config string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSource {
    /// Name of an embedded SVG asset (without extension)
    BuiltIn(String),
    /// Path to a user image file
    LocalFile(PathBuf),
    /// Community feed wallpaper
    Community,
}

impl BackgroundSource {
    /// Parses the configuration string.
    ///
    /// Any value starting with `community` selects the community feed, so
    /// variants like `community:default` written by older pickers still work.
    pub fn parse(value: &str) -> Self {
        if let Some(name) = value.strip_prefix("inbuilt:") {
            BackgroundSource::BuiltIn(name.to_string())
        } else if value.starts_with("community") {
            BackgroundSource::Community
        } else {
            BackgroundSource::LocalFile(PathBuf::from(value))
        }
    }

    pub fn is_community(&self) -> bool {
        matches!(self, BackgroundSource::Community)
    }
}

/// User configuration for the background daemon.
///
/// Persisted to `~/.config/shell-background/config.json` as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Background source string (see [`BackgroundSource::parse`])
    #[serde(default = "default_source")]
    pub background: String,
    /// Whether to draw the name/location/author credits over community images
    #[serde(default = "default_true")]
    pub show_labels: bool,
    /// Minutes between community background refreshes
    #[serde(default = "default_wait_time")]
    pub wait_time: u32,
    /// When the community cache was last refreshed (or last attempted and failed)
    #[serde(default)]
    pub fetched: Option<DateTime<Utc>>,
    /// Host serving `/theshell/backgrounds/...`
    #[serde(default = "default_feed_base")]
    pub feed_base: String,
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_wait_time() -> u32 {
    DEFAULT_WAIT_TIME
}

fn default_feed_base() -> String {
    DEFAULT_FEED_BASE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            background: default_source(),
            show_labels: true,
            wait_time: DEFAULT_WAIT_TIME,
            fetched: None,
            feed_base: default_feed_base(),
        }
    }
}

impl Config {
    /// Returns the path to the configuration file.
    pub fn config_path() -> Option<PathBuf> {
        app_config_dir().map(|p| p.join("config.json"))
    }

    /// The parsed background source.
    pub fn source(&self) -> BackgroundSource {
        BackgroundSource::parse(&self.background)
    }

    /// Loads the configuration from disk.
    ///
    /// If the config file doesn't exist or cannot be parsed, returns default values.
    /// This ensures the daemon always starts with a valid configuration.
    pub fn load() -> Self {
        Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Loads from an explicit path, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| match serde_json::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring malformed config: {e}");
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Persists the configuration to `path`.
    ///
    /// Creates the parent directory if it doesn't exist. The configuration is
    /// stored as pretty-printed JSON for easy manual editing if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Persists the configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::Config("could not determine config path".to_string()))?;
        self.save_to(&path)
    }
}

/// The configuration plus where it lives on disk.
///
/// This is the context object handed to fetchers and the D-Bus service.
/// `path` is `None` for in-memory stores (tests, one-shot rendering).
#[derive(Debug, Clone)]
pub struct ConfigStore {
    pub config: Config,
    path: Option<PathBuf>,
}

/// Shared handle used across the daemon loop and the D-Bus interface.
pub type SharedConfig = Arc<RwLock<ConfigStore>>;

impl ConfigStore {
    /// Loads the user's configuration from the default location.
    pub fn load() -> Self {
        let path = Config::config_path();
        let config = path.as_deref().map(Config::load_from).unwrap_or_default();
        Self { config, path }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            config: Config::load_from(&path),
            path: Some(path),
        }
    }

    #[cfg(test)]
    pub fn in_memory(config: Config) -> Self {
        Self { config, path: None }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the current configuration back to its file, if it has one.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.config.save_to(path),
            None => Ok(()),
        }
    }

    /// Re-reads the file, e.g. after another process edited it.
    pub fn reload(&mut self) {
        if let Some(path) = &self.path {
            self.config = Config::load_from(path);
        }
    }

    /// Stamps the last-fetched time and persists it.
    ///
    /// Only `fetched` is written back; every other key keeps what is on disk.
    pub fn record_fetch(&mut self, at: DateTime<Utc>) {
        self.config.fetched = Some(at);
        let Some(path) = &self.path else {
            return;
        };
        let mut on_disk = Config::load_from(path);
        on_disk.fetched = Some(at);
        if let Err(e) = on_disk.save_to(path) {
            tracing::warn!("failed to persist fetch time: {e}");
        }
    }
}
