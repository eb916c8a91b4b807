//! Persistent configuration for trellis.
//!
//! Stores user settings in `~/.trellis/config.json`. Every field has a
//! default, so a missing file (or a file that sets only a few keys) is fine.
//! The CLI layers its flags on top of whatever is loaded here.
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::config::TrellisConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = TrellisConfig::load();
//! println!("default timeout: {}ms", config.default_timeout_ms);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Errors raised while reading an explicitly requested config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Returns the trellis data directory (`~/.trellis/`), creating it if needed.
///
/// Falls back to `./.trellis` when the home directory cannot be determined.
pub fn trellis_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trellis");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the session logs directory (`~/.trellis/logs/`).
pub fn logs_dir() -> PathBuf {
    let dir = trellis_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Persistent trellis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    /// Base URL scripts can read as `config.base_url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Timeout for `wait for` and service calls when none is given.
    pub default_timeout_ms: u64,

    /// Browser name reported to scripts as `browser.name`.
    pub browser: String,

    pub headless: bool,

    /// Extra variables exposed through `env`, on top of the process environment.
    pub env: BTreeMap<String, String>,

    /// Seed for the `random` namespace. Unset means a fresh seed per run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,

    /// Write a JSON Lines action log for each run under `~/.trellis/logs/`.
    pub session_log: bool,
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_timeout_ms: 5000,
            browser: "chromium".to_string(),
            headless: true,
            env: BTreeMap::new(),
            random_seed: None,
            session_log: true,
        }
    }
}

impl TrellisConfig {
    /// Path of the default config file.
    pub fn default_path() -> PathBuf {
        trellis_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.trellis/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        std::fs::read_to_string(Self::default_path())
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Load config from an explicit path. Unlike [`load`](Self::load), a
    /// missing or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to `~/.trellis/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(Self::default_path(), json)
    }

    /// The configuration as scripts see it through `config`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
