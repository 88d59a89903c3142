use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse TOML: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Config file already exists: {0:?}")]
    AlreadyExists(PathBuf),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::ReadError(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::ParseError(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_true")]
    pub grab: bool,
    #[serde(default = "default_idle_retry_ms")]
    pub idle_retry_ms: u64,
    #[serde(default = "default_read_batch")]
    pub read_batch: usize,
    #[serde(default = "default_true")]
    pub rescan_when_idle: bool,
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/input")
}

fn default_name_prefix() -> String {
    "event".to_string()
}

fn default_true() -> bool {
    true
}

fn default_idle_retry_ms() -> u64 {
    100
}

fn default_read_batch() -> usize {
    64
}

/// Upper bound on `read_batch`; the read buffer is allocated up front.
pub const MAX_READ_BATCH: usize = 4096;

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_dir: default_device_dir(),
            name_prefix: default_name_prefix(),
            grab: default_true(),
            idle_retry_ms: default_idle_retry_ms(),
            read_batch: default_read_batch(),
            rescan_when_idle: default_true(),
        }
    }
}

impl MonitorConfig {
    pub fn idle_retry(&self) -> Duration {
        Duration::from_millis(self.idle_retry_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

const DEFAULT_CONFIG: &str = r#"# inputmon configuration
# All options are shown with their default values.

[monitor]
# Directory holding the input device nodes
device_dir = "/dev/input"
# Only entries starting with this prefix are treated as devices
name_prefix = "event"
# Ask for exclusive access to every device (failure is not fatal)
grab = true
# Sleep between retries while there is nothing to wait on
idle_retry_ms = 100
# Maximum number of event records taken from a device per read
read_batch = 64
# Re-scan the directory while idle if change notifications are unavailable
rescan_when_idle = true

[output]
# "text" or "json" (one object per line)
format = "text"
"#;

impl Config {
    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = Self::config_path()?;
                if !default_path.exists() {
                    tracing::debug!("No config at {:?}, using defaults", default_path);
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let contents = fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadError(format!("{:?}: {}", config_path, e)))?;
        let config = Self::from_toml(&contents)?;
        tracing::debug!("Config loaded from {:?}", config_path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.read_batch == 0 || self.monitor.read_batch > MAX_READ_BATCH {
            return Err(ConfigError::Invalid(format!(
                "monitor.read_batch must be between 1 and {}",
                MAX_READ_BATCH
            )));
        }
        if self.monitor.idle_retry_ms == 0 {
            return Err(ConfigError::Invalid("monitor.idle_retry_ms must be at least 1".to_string()));
        }
        if self.monitor.name_prefix.is_empty() {
            return Err(ConfigError::Invalid("monitor.name_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn create_default_config(config_path: &Path) -> Result<(), ConfigError> {
        if config_path.exists() {
            return Err(ConfigError::AlreadyExists(config_path.to_path_buf()));
        }
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create config directory: {}", e)))?;
        }

        fs::write(config_path, DEFAULT_CONFIG)
            .map_err(|e| ConfigError::ReadError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Created default config file at {:?}", config_path);
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::ReadError("Could not find config directory".to_string()))?;
        Ok(config_dir.join("inputmon").join("config.toml"))
    }
}
