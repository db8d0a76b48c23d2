/*!
 * Error types for the relay pump
 */

use crate::endpoint::EndpointError;
use pump_core_resilience::ResilienceError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PumpError>;

/// Errors surfaced to the pump operator
///
/// Endpoint faults met while relaying are handled inside the lanes and never
/// show up here; only start-up, configuration and shutdown problems do.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Configuration values are unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint operation failed outside of a lane
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Lane connections could not be opened
    #[error("Connection error: {0}")]
    Connection(#[from] ResilienceError),

    /// A lane task panicked or was aborted
    #[error("Lane {lane} did not shut down cleanly: {reason}")]
    LaneJoin { lane: usize, reason: String },
}

impl PumpError {
    /// Check if this error is fatal (retrying the same call will not help)
    pub fn is_fatal(&self) -> bool {
        match self {
            PumpError::Config(_)
            | PumpError::ConfigParse(_)
            | PumpError::ConfigSerialize(_)
            | PumpError::LaneJoin { .. } => true,
            PumpError::Connection(e) => !e.is_transient(),
            PumpError::Endpoint(_) | PumpError::Io(_) => false,
        }
    }
}
