//! Error types for the resilience primitives

use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Connection creation failed
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(String),

    /// A primitive was configured with values it cannot operate on
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pool was asked for zero lanes
    #[error("Lane pool requires at least one lane")]
    EmptyPool,
}

impl ResilienceError {
    /// Check if this error may clear up on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ResilienceError::ConnectionCreation(_))
    }
}
