use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::chat_stream::LegacyFormatPolicy;

const DEFAULT_ABORTED_PHRASES: &[&str] = &["aborted by user", "request aborted", "cancelled by user"];

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// No home directory could be determined for the platform config path.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path.display(), source)
            }
            ConfigError::NoConfigDir => write!(f, "Failed to determine config directory"),
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NoConfigDir => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between batched UI flushes, in milliseconds.
    pub frame_interval_ms: u64,
    /// Treatment of unrecognized payloads on the legacy raw channel.
    pub legacy_format: LegacyFormatPolicy,
    /// Whether the HTTP backend publishes normalized events (otherwise raw SSE).
    pub emit_normalized: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            legacy_format: LegacyFormatPolicy::Lenient,
            emit_normalized: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GestureConfig {
    /// Horizontal drag distance that commits a swipe.
    pub swipe_threshold_px: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            swipe_threshold_px: 80.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    /// Error texts (case-insensitive substrings) that mean the user aborted.
    pub aborted_phrases: Vec<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            aborted_phrases: DEFAULT_ABORTED_PHRASES
                .iter()
                .map(|phrase| phrase.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Root for `sessions/` and `characters/`; platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    /// `tracing` filter directive, overridden by `PARLANCE_LOG`.
    pub log_filter: Option<String>,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub gestures: GestureConfig,
    #[serde(default)]
    pub turns: TurnConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn StdError>> {
        let config_path = Self::get_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, Box<dyn StdError>> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), Box<dyn StdError>> {
        let config_path = Self::get_config_path()?;
        self.save_to_path(&config_path)
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn StdError> { Box::new(err) })?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf, ConfigError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.stream.frame_interval_ms.max(1))
    }

    pub fn print_all(&self) {
        println!("Current configuration:");
        match &self.data_dir {
            Some(dir) => println!("  data-dir: {}", dir.display()),
            None => println!("  data-dir: (platform default)"),
        }
        println!(
            "  log-filter: {}",
            self.log_filter.as_deref().unwrap_or("info")
        );
        println!("  frame-interval-ms: {}", self.stream.frame_interval_ms);
        println!("  legacy-format: {:?}", self.stream.legacy_format);
        println!("  swipe-threshold-px: {}", self.gestures.swipe_threshold_px);
        println!("  backend: {} ({})", self.backend.base_url, self.backend.model);
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "parlance", "parlance")
}
