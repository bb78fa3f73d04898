use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_GPUNAME_WIDTH: usize = 256;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: String,
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub command_timeout: Duration,
    #[serde(default = "default_container_lookup")]
    pub container_lookup: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DisplayConfig {
    #[serde(default = "default_color")]
    pub color: bool,
    #[serde(default)]
    pub show_cmd: bool,
    #[serde(default)]
    pub show_user: bool,
    #[serde(default)]
    pub show_pid: bool,
    #[serde(default = "default_gpuname_width")]
    pub gpuname_width: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            nvidia_smi: default_nvidia_smi(),
            command_timeout: default_command_timeout(),
            container_lookup: default_container_lookup(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            color: default_color(),
            show_cmd: false,
            show_user: false,
            show_pid: false,
            gpuname_width: default_gpuname_width(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.nvidia_smi.trim().is_empty() {
            return Err(ConfigError::Validation(
                "query.nvidia_smi must not be empty".to_string(),
            ));
        }
        if self.query.command_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "query.command_timeout must be > 0".to_string(),
            ));
        }
        if self.query.command_timeout > MAX_COMMAND_TIMEOUT {
            return Err(ConfigError::Validation(format!(
                "query.command_timeout must be <= {}",
                humantime::format_duration(MAX_COMMAND_TIMEOUT)
            )));
        }
        validate_gpuname_width(self.display.gpuname_width)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub fn validate_gpuname_width(width: usize) -> Result<(), ConfigError> {
    if !(1..=MAX_GPUNAME_WIDTH).contains(&width) {
        return Err(ConfigError::Validation(format!(
            "gpuname_width must be in range 1..{MAX_GPUNAME_WIDTH}"
        )));
    }
    Ok(())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn default_nvidia_smi() -> String {
    "nvidia-smi".to_string()
}

const fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_container_lookup() -> bool {
    true
}

const fn default_color() -> bool {
    true
}

const fn default_gpuname_width() -> usize {
    16
}
