use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::state_machine::{ManagerConfig, RetryPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: LogRotation,
    /// Rotated files kept per participant; unbounded when absent
    #[serde(default)]
    pub max_log_files: Option<usize>,
    /// Participant id this connector acts as
    pub participant_id: String,
    /// Address counterparties reach this connector at
    pub address: String,
    /// Protocol name outbound messages are dispatched with
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// PostgreSQL store; in-memory stores when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub negotiation: EngineConfig,
    #[serde(default)]
    pub transfer: EngineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

fn default_protocol() -> String {
    "dataspace-protocol-http".to_string()
}

/// Polling and retry settings of one process type
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub iteration_wait_ms: u64,
    pub lease_duration_ms: u64,
    pub parallelism: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            iteration_wait_ms: 1_000,
            lease_duration_ms: 60_000,
            parallelism: 4,
            max_retries: 7,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid("lease_duration_ms must be positive".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

impl From<&EngineConfig> for ManagerConfig {
    fn from(c: &EngineConfig) -> Self {
        Self {
            batch_size: c.batch_size,
            iteration_wait: Duration::from_millis(c.iteration_wait_ms),
            lease_duration: Duration::from_millis(c.lease_duration_ms),
            parallelism: c.parallelism.max(1),
            retry: RetryPolicy {
                max_retries: c.max_retries,
                base_delay: Duration::from_millis(c.backoff_base_ms),
                max_delay: Duration::from_millis(c.backoff_max_ms),
            },
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: config_path,
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        if config.max_log_files == Some(0) {
            return Err(ConfigError::Invalid("max_log_files must be at least 1".into()));
        }
        config.negotiation.validate()?;
        config.transfer.validate()?;
        Ok(config)
    }
}
