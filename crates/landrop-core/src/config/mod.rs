//! Configuration management for Landrop.
//!
//! This module handles loading, saving, and managing Landrop configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/landrop/config.toml` |
//! | macOS | `~/Library/Application Support/Landrop/config.toml` |
//! | Windows | `%APPDATA%\Landrop\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use landrop_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Main configuration struct for Landrop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Restore settings
    pub restore: RestoreConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name announced to the sender during the handshake
    pub device_name: String,
    /// Where received archives are written
    pub storage_dir: Option<PathBuf>,
    /// Local datastore that restores import into
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Landrop Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            storage_dir: None,
            data_dir: None,
        }
    }
}

/// How connection candidates are probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// One candidate at a time, in listed order
    #[default]
    Sequential,
    /// All candidates at once; the earliest listed success still wins
    Parallel,
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port assumed when a scanned host carries none
    pub default_port: u16,
    /// Per-candidate probe timeout
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Candidate probing strategy
    pub probe_strategy: ProbeStrategy,
    /// WebSocket upgrade plus hello/ack timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_port: crate::DEFAULT_LANDROP_PORT,
            probe_timeout: Duration::from_secs(3),
            probe_strategy: ProbeStrategy::Sequential,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How often the receiver pings the sender
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which the session is considered dead
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Chunk size used when sending
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Restore configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Upper bound for a single restore step (`None` waits forever)
    #[serde(with = "humantime_serde::option")]
    pub step_timeout: Option<Duration>,
    /// Leave the restore screen for a fresh chat once a restore succeeds
    pub redirect_on_success: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(30 * 60)),
            redirect_on_success: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::error::Error::ConfigError(format!("Failed to serialize config: {e}"))
        })?;

        std::fs::write(&path, content)
            .map_err(|e| crate::error::Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "landrop", "Landrop")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Directory received archives are written to.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.general.storage_dir.clone().unwrap_or_else(|| {
            Self::project_data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("backups")
        })
    }

    /// Local datastore directory restores import into.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            Self::project_data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("data")
        })
    }

    fn project_data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "landrop", "Landrop")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }
}

/// Parse a duration such as `250ms`, `3s`, `30m` or `1h`.
///
/// # Errors
///
/// Returns [`crate::Error::ConfigError`] for anything else.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime_serde::parse(value)
        .map_err(|e| crate::error::Error::ConfigError(format!("invalid duration '{value}': {e}")))
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| n.parse::<u64>().map_err(|e| e.to_string());

        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            Err("invalid duration format".to_string())
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        #[allow(clippy::ref_option)]
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_str("off"),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            if s.trim().eq_ignore_ascii_case("off") {
                return Ok(None);
            }
            super::parse(&s).map(Some).map_err(serde::de::Error::custom)
        }
    }
}
