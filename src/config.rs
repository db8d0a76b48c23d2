/*!
 * Configuration types for the relay pump
 */

use crate::error::{PumpError, Result};
use pump_core_resilience::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a message pump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Number of independent lanes relaying in parallel
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Messages each lane's receiver buffers ahead of explicit receives
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: usize,

    /// Bounded wait for a single receive call, in milliseconds
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Backoff for receive, complete and dead-letter retries
    #[serde(default)]
    pub source_backoff: BackoffSettings,

    /// Backoff for send retries
    #[serde(default)]
    pub destination_backoff: BackoffSettings,

    /// Reason attached to messages dead-lettered after a permanent send failure
    #[serde(default = "default_dead_letter_reason")]
    pub dead_letter_reason: String,

    /// Log elapsed time once this many messages have been relayed
    #[serde(default)]
    pub throughput_target: Option<u64>,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            prefetch_count: default_prefetch_count(),
            receive_timeout_ms: default_receive_timeout_ms(),
            source_backoff: BackoffSettings::default(),
            destination_backoff: BackoffSettings::default(),
            dead_letter_reason: default_dead_letter_reason(),
            throughput_target: None,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Backoff floor and ceiling in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_min_ms")]
    pub min_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min_ms: default_backoff_min_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

impl BackoffSettings {
    /// Same floor and ceiling, useful for tests that need a fixed delay
    pub fn fixed(ms: u64) -> Self {
        Self {
            min_ms: ms,
            max_ms: ms,
        }
    }

    /// Convert to the resilience crate's representation
    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            min: Duration::from_millis(self.min_ms),
            max: Duration::from_millis(self.max_ms),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_parallelism() -> usize {
    4
}

fn default_prefetch_count() -> usize {
    10
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_backoff_min_ms() -> u64 {
    25
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_dead_letter_reason() -> String {
    "RelayFailed".to_string()
}

impl PumpConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PumpConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Bounded wait for one receive call
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(PumpError::Config(
                "parallelism must be at least 1".to_string(),
            ));
        }

        if self.receive_timeout_ms == 0 {
            return Err(PumpError::Config(
                "receive_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.dead_letter_reason.trim().is_empty() {
            return Err(PumpError::Config(
                "dead_letter_reason must not be empty".to_string(),
            ));
        }

        self.source_backoff
            .to_backoff_config()
            .validate()
            .map_err(|e| PumpError::Config(format!("source_backoff: {}", e)))?;
        self.destination_backoff
            .to_backoff_config()
            .validate()
            .map_err(|e| PumpError::Config(format!("destination_backoff: {}", e)))?;

        Ok(())
    }
}
