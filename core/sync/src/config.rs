//! Configuration loading and saving.
//!
//! Settings live in `~/.figma-presence/config.json`. Absent fields fall back
//! to built-in defaults; a missing or unreadable file behaves like an empty
//! one. The only fatal configuration fault is a missing presence host
//! application id, which is checked separately via [`Config::validate`].

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const CONFIG_DIR_NAME: &str = ".figma-presence";
const CONFIG_FILE_NAME: &str = "config.json";
/// Overrides the config file path; used by tests.
const CONFIG_ENV: &str = "FIGMA_PRESENCE_CONFIG";

/// Shipped in sample configs; treated the same as no id at all.
const CLIENT_ID_PLACEHOLDER: &str = "YOUR_APPLICATION_ID_HERE";

const DEFAULT_DETAILS: &str = "🎨 Designing in Figma";
const DEFAULT_STATE: &str = "Creating amazing designs";
const DEFAULT_LARGE_IMAGE_KEY: &str = "figma_logo";
const DEFAULT_LARGE_IMAGE_TEXT: &str = "Figma - Professional Design Tool";
const DEFAULT_SMALL_IMAGE_KEY: &str = "online_status";
const DEFAULT_SMALL_IMAGE_TEXT: &str = "Online";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("No presence host application id configured; run `figma-presence setup --client-id <id>`")]
    MissingClientId,

    #[error("Failed to write config: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub client_id: String,
    pub details: String,
    pub state: String,
    pub large_image_key: Option<String>,
    pub large_image_text: Option<String>,
    pub small_image_key: Option<String>,
    pub small_image_text: Option<String>,
    pub buttons: Vec<ButtonConfig>,
    pub poll_interval_ms: u64,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonConfig {
    pub label: String,
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            details: DEFAULT_DETAILS.to_string(),
            state: DEFAULT_STATE.to_string(),
            large_image_key: Some(DEFAULT_LARGE_IMAGE_KEY.to_string()),
            large_image_text: Some(DEFAULT_LARGE_IMAGE_TEXT.to_string()),
            small_image_key: Some(DEFAULT_SMALL_IMAGE_KEY.to_string()),
            small_image_text: Some(DEFAULT_SMALL_IMAGE_TEXT.to_string()),
            buttons: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            debug: false,
        }
    }
}

impl Config {
    /// Loads the configuration, falling back to defaults when the file is
    /// missing or malformed. Malformed files are logged, not fatal.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Could not read config, using defaults");
                return Ok(Self::default());
            }
        };

        match serde_json::from_str(&data) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Config file malformed, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Rejects a missing or placeholder host application id. This is the one
    /// configuration fault that must stop the process before any connection
    /// attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.client_id.trim();
        if id.is_empty() || id == CLIENT_ID_PLACEHOLDER {
            return Err(ConfigError::MissingClientId);
        }
        Ok(())
    }

    /// Persists the configuration atomically (write to a temp file, rename).
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| ConfigError::Write {
                path: path.clone(),
                source: err,
            })?;
        }

        let payload = serde_json::to_vec_pretty(self).map_err(|err| ConfigError::Write {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload).map_err(|err| ConfigError::Write {
            path: tmp_path.clone(),
            source: err,
        })?;
        fs::rename(&tmp_path, &path).map_err(|err| ConfigError::Write {
            path: path.clone(),
            source: err,
        })?;
        Ok(path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
