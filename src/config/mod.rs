use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const CONFIG_FILE_NAME: &str = "jobrelay.toml";
pub const HOME_CONFIG_PATH: &str = ".jobrelay/config.toml";
const CONFIG_PATH_ARG: &str = "--config";

/// SQS refuses batches above ten messages and long polls above twenty seconds.
pub const MAX_JOBS_PER_REQUEST_LIMIT: u32 = 10;
pub const MAX_RECEIVE_WAIT_SECONDS: u32 = 20;
pub const MAX_DELAY_SECONDS: u32 = 900;
pub const MIN_INTERVAL_MS: u64 = 10;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub topology: TopologyConfig,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub role: RoleConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub backend: String,
    pub region: String,
    pub account_id: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TopologyConfig {
    pub topic_name: String,
    pub queue_name: String,
    pub delay_seconds: u32,
    pub retention_seconds: u32,
    pub receive_wait_seconds: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub max_jobs_per_request: u32,
    pub job_processing_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct PublisherConfig {
    pub demo_interval_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct RoleConfig {
    pub publisher: bool,
    pub consumer: bool,
}

impl AppConfig {
    /// Resolves the config file and applies `--section.key value` overrides.
    ///
    /// An explicit `--config <path>` wins; otherwise `./jobrelay.toml` and then
    /// `$HOME/.jobrelay/config.toml` are tried.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_path_arg(args)?;
        let path = match explicit_path {
            Some(path) => path,
            None => discover_config_path(env::var_os("HOME").map(PathBuf::from))?,
        };

        Self::load_from_toml_with_args(path, overrides)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("broker.region", &self.broker.region)?;
        require_non_empty("topology.topic_name", &self.topology.topic_name)?;
        require_non_empty("topology.queue_name", &self.topology.queue_name)?;

        if self.topology.receive_wait_seconds > MAX_RECEIVE_WAIT_SECONDS {
            return Err(ConfigError::InvalidValue {
                key: "topology.receive_wait_seconds",
                reason: format!("must be at most {MAX_RECEIVE_WAIT_SECONDS}"),
            });
        }
        if self.topology.delay_seconds > MAX_DELAY_SECONDS {
            return Err(ConfigError::InvalidValue {
                key: "topology.delay_seconds",
                reason: format!("must be at most {MAX_DELAY_SECONDS}"),
            });
        }
        // The subscription confirmation is delayed too and must land inside the handshake receive.
        if self.topology.delay_seconds > self.topology.receive_wait_seconds {
            return Err(ConfigError::InvalidValue {
                key: "topology.delay_seconds",
                reason: format!(
                    "must not exceed topology.receive_wait_seconds ({})",
                    self.topology.receive_wait_seconds
                ),
            });
        }
        if self.consumer.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.worker_count",
                reason: "must be at least 1".to_owned(),
            });
        }
        if !(1..=MAX_JOBS_PER_REQUEST_LIMIT).contains(&self.consumer.max_jobs_per_request) {
            return Err(ConfigError::InvalidValue {
                key: "consumer.max_jobs_per_request",
                reason: format!("must be between 1 and {MAX_JOBS_PER_REQUEST_LIMIT}"),
            });
        }
        if self.consumer.poll_interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::InvalidValue {
                key: "consumer.poll_interval_ms",
                reason: format!("must be at least {MIN_INTERVAL_MS}"),
            });
        }
        if self.publisher.demo_interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::InvalidValue {
                key: "publisher.demo_interval_ms",
                reason: format!("must be at least {MIN_INTERVAL_MS}"),
            });
        }
        if !self.role.publisher && !self.role.consumer {
            return Err(ConfigError::InvalidValue {
                key: "role",
                reason: "at least one of role.publisher and role.consumer must be enabled"
                    .to_owned(),
            });
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    NotFound {
        searched: Vec<PathBuf>,
    },
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidValue {
        key: &'static str,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::NotFound { searched } => {
                let searched = searched
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "no config file found; searched: {searched}")
            }
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidValue { key, reason } => write!(f, "invalid value for '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn require_non_empty(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            key,
            reason: "must not be empty".to_owned(),
        });
    }
    Ok(())
}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut explicit_path = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            explicit_path = Some(PathBuf::from(path));
        } else {
            remaining.push(arg);
        }
    }

    Ok((explicit_path, remaining))
}

fn discover_config_path(home: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = home {
        candidates.push(home.join(HOME_CONFIG_PATH));
    }

    match candidates.iter().find(|candidate| candidate.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(ConfigError::NotFound {
            searched: candidates,
        }),
    }
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(|| ConfigError::InvalidPath {
        key: key_path.to_owned(),
    })?;

    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
