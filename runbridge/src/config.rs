//! Configuration management for runbridge
//!
//! Centralized configuration with environment variable support and sensible
//! defaults. A YAML file can override individual values; environment
//! variables (prefix `RUNBRIDGE_`) win over both.

use crate::common::env_loader::EnvLoader;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "/var/lib/runbridge";
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;
const DEFAULT_DB_MAX_TRIES: u32 = 5;
const DEFAULT_STATUS_RETRY_ATTEMPTS: u32 = 4;
const DEFAULT_STATUS_RETRY_INITIAL_SECS: u64 = 1;
const DEFAULT_STATUS_RETRY_MAX_SECS: u64 = 6;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file from disk
    #[error("Failed to read configuration file {path}: {source}")]
    FileRead {
        /// Path to the configuration file that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML content from a configuration file
    #[error("Invalid YAML syntax in {path}: {source}")]
    YamlParse {
        /// Path to the configuration file with invalid YAML content
        path: PathBuf,
        /// Underlying YAML parsing error
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value for a specific field
    #[error("Invalid configuration value for '{field}': {value}\n{hint}")]
    InvalidValue {
        /// Name of the offending field
        field: String,
        /// The invalid value that was provided
        value: String,
        /// Helpful hint about how to fix the issue
        hint: String,
    },
}

/// Configuration settings for the runbridge engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory under which per-run work and log directories live
    pub data_dir: PathBuf,
    /// Interval between reconciliation sweeps of active runs
    pub monitor_interval: Duration,
    /// Bound for database compare-and-swap retry loops
    pub db_max_tries: u32,
    /// Retry bound for transient backend status-query failures
    pub status_retry_attempts: u32,
    /// Initial backoff for status-query retries
    pub status_retry_initial: Duration,
    /// Backoff cap for status-query retries
    pub status_retry_max: Duration,
    /// How long a run may sit on exclusively-unknown observations before it
    /// is closed as a system error. `None` means wait indefinitely, which is
    /// the default.
    pub unknown_state_timeout: Option<Duration>,
    /// Workflow types accepted by request validation
    pub supported_workflow_types: Vec<String>,
}

/// Optional YAML overrides, all fields defaulting to "keep current value"
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    monitor_interval_secs: Option<u64>,
    db_max_tries: Option<u32>,
    status_retry_attempts: Option<u32>,
    status_retry_initial_secs: Option<u64>,
    status_retry_max_secs: Option<u64>,
    unknown_state_timeout_secs: Option<u64>,
    supported_workflow_types: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            db_max_tries: DEFAULT_DB_MAX_TRIES,
            status_retry_attempts: DEFAULT_STATUS_RETRY_ATTEMPTS,
            status_retry_initial: Duration::from_secs(DEFAULT_STATUS_RETRY_INITIAL_SECS),
            status_retry_max: Duration::from_secs(DEFAULT_STATUS_RETRY_MAX_SECS),
            unknown_state_timeout: None,
            supported_workflow_types: vec!["SMK".to_string(), "NFL".to_string()],
        }
    }
}

impl Config {
    /// Build configuration from defaults plus `RUNBRIDGE_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let loader = EnvLoader::new("RUNBRIDGE");
        let defaults = Config::default();
        Self {
            data_dir: PathBuf::from(
                loader.load_string("DATA_DIR", &defaults.data_dir.to_string_lossy()),
            ),
            monitor_interval: Duration::from_secs(
                loader.load_parsed("MONITOR_INTERVAL_SECS", DEFAULT_MONITOR_INTERVAL_SECS),
            ),
            db_max_tries: loader.load_parsed("DB_MAX_TRIES", DEFAULT_DB_MAX_TRIES),
            status_retry_attempts: loader
                .load_parsed("STATUS_RETRY_ATTEMPTS", DEFAULT_STATUS_RETRY_ATTEMPTS),
            status_retry_initial: Duration::from_secs(
                loader.load_parsed("STATUS_RETRY_INITIAL_SECS", DEFAULT_STATUS_RETRY_INITIAL_SECS),
            ),
            status_retry_max: Duration::from_secs(
                loader.load_parsed("STATUS_RETRY_MAX_SECS", DEFAULT_STATUS_RETRY_MAX_SECS),
            ),
            unknown_state_timeout: loader
                .load_optional::<u64>("UNKNOWN_STATE_TIMEOUT_SECS")
                .map(Duration::from_secs),
            supported_workflow_types: defaults.supported_workflow_types,
        }
    }

    /// Load configuration from a YAML file on top of environment defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = Config::from_env();
        if let Some(dir) = file.data_dir {
            config.data_dir = dir;
        }
        if let Some(secs) = file.monitor_interval_secs {
            config.monitor_interval = Duration::from_secs(secs);
        }
        if let Some(tries) = file.db_max_tries {
            config.db_max_tries = tries;
        }
        if let Some(attempts) = file.status_retry_attempts {
            config.status_retry_attempts = attempts;
        }
        if let Some(secs) = file.status_retry_initial_secs {
            config.status_retry_initial = Duration::from_secs(secs);
        }
        if let Some(secs) = file.status_retry_max_secs {
            config.status_retry_max = Duration::from_secs(secs);
        }
        if let Some(secs) = file.unknown_state_timeout_secs {
            config.unknown_state_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(types) = file.supported_workflow_types {
            config.supported_workflow_types = types;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_max_tries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "db_max_tries".to_string(),
                value: "0".to_string(),
                hint: "At least one update attempt is required".to_string(),
            });
        }
        if self.status_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "status_retry_attempts".to_string(),
                value: "0".to_string(),
                hint: "At least one status query attempt is required".to_string(),
            });
        }
        Ok(())
    }

    /// Retry policy used for transient backend status-query failures
    pub fn status_retry_policy(&self) -> crate::RetryPolicy {
        crate::RetryPolicy::new(
            self.status_retry_attempts,
            self.status_retry_initial,
            self.status_retry_max,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_waits_forever_on_unknown() {
        let config = Config::default();
        assert!(config.unknown_state_timeout.is_none());
    }

    #[test]
    fn test_config_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "monitor_interval_secs: 5\nunknown_state_timeout_secs: 3600\ndb_max_tries: 9"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.unknown_state_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.db_max_tries, 9);
    }

    #[test]
    fn test_config_rejects_zero_tries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "db_max_tries: 0").unwrap();
        let result = Config::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_config_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor_interval_secs: [not a number").unwrap();
        let result = Config::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::YamlParse { .. })));
    }
}
