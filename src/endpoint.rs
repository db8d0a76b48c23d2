/*!
 * Messaging endpoint collaborator contracts
 *
 * The pump only ever talks to queues through these traits. Transport,
 * addressing and authentication live behind them.
 */

use crate::message::{LockToken, Message, ReceivedMessage};
use async_trait::async_trait;
use pump_core_resilience::ErrorCategory;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single endpoint operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{category}: {message}")]
pub struct EndpointError {
    pub category: ErrorCategory,
    pub message: String,
}

impl EndpointError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unavailable, message)
    }

    pub fn entity_not_found(path: &str) -> Self {
        Self::new(
            ErrorCategory::EntityNotFound,
            format!("entity '{}' does not exist", path),
        )
    }

    pub fn lock_lost(token: &LockToken) -> Self {
        Self::new(
            ErrorCategory::LockLost,
            format!("lock {} is unknown or has expired", token),
        )
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Shutdown, message)
    }
}

/// Per-queue settings understood by entity provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// How long a received message stays locked before redelivery
    pub lock_duration: Duration,

    /// Deliveries allowed before the broker dead-letters a message itself
    pub max_delivery_count: u32,

    /// Largest accepted body, in bytes
    pub max_message_size: usize,

    /// Applied to messages sent without their own time-to-live
    pub default_time_to_live: Option<Duration>,

    /// Entries kept in the dead-letter store before the oldest are dropped
    pub dead_letter_capacity: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            max_message_size: 256 * 1024,
            default_time_to_live: None,
            dead_letter_capacity: 10_000,
        }
    }
}

/// Receiving half of a lane connection
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `timeout` for one message; `Ok(None)` when none arrived
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, EndpointError>;

    /// Acknowledge and remove a locked message
    async fn complete(&self, lock_token: &LockToken) -> Result<(), EndpointError>;

    /// Move a locked message to the dead-letter store
    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), EndpointError>;

    /// Look at up to `max_count` available messages without locking them
    async fn peek(&self, max_count: usize) -> Result<Vec<Message>, EndpointError>;

    /// Release the connection
    async fn close(&self) {}
}

/// Sending half of a lane connection
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Durably enqueue a message
    async fn send(&self, message: Message) -> Result<(), EndpointError>;

    /// Release the connection
    async fn close(&self) {}
}

/// Queue the pump reads from
#[async_trait]
pub trait SourceEndpoint: Send + Sync {
    /// Entity path, used for logging
    fn path(&self) -> &str;

    /// Open a dedicated receiver buffering up to `prefetch_count` extra messages
    async fn open_receiver(
        &self,
        prefetch_count: usize,
    ) -> Result<Box<dyn MessageReceiver>, EndpointError>;
}

/// Queue the pump writes to
#[async_trait]
pub trait DestinationEndpoint: Send + Sync {
    /// Entity path, used for logging
    fn path(&self) -> &str;

    /// Open a dedicated sender
    async fn open_sender(&self) -> Result<Box<dyn MessageSender>, EndpointError>;
}

/// Queue provisioning
#[async_trait]
pub trait EntityManager: Send + Sync {
    async fn create_queue(&self, path: &str, options: QueueOptions) -> Result<(), EndpointError>;

    async fn delete_queue(&self, path: &str) -> Result<(), EndpointError>;

    async fn queue_exists(&self, path: &str) -> Result<bool, EndpointError>;
}
