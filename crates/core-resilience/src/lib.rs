//! Pump Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the relay pump uses to survive
//! transient failures of the endpoints it talks to:
//!
//! - **Backoff Timer**: Doubling wait interval per failure domain, reset on success
//! - **Fault Classifier**: Maps an error category to Transient, Permanent or Cancellation
//! - **Dead-Letter Queue**: Bounded quarantine for permanently unprocessable items
//! - **Lane Pool**: One independently owned connection per worker lane
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Message formats or queue semantics
//! - Network protocols or transports
//! - Application-specific concerns
//!
//! # Architecture
//!
//! ```text
//!         Endpoint operation fails
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fault Classifier                  │  ← What kind of failure?
//! │  (static category → kind mapping)       │
//! └──────┬──────────────┬──────────────┬────┘
//!        │ Transient    │ Permanent    │ Cancellation
//!        ▼              ▼              ▼
//! ┌──────────────┐ ┌──────────────┐  stop lane
//! │ Backoff      │ │ Dead-Letter  │
//! │ Timer        │ │ Queue        │
//! │ (retry after │ │ (park item,  │
//! │  get())      │ │  move on)    │
//! └──────────────┘ └──────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use pump_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! let classifier = StaticFaultClassifier::new();
//! let backoff = BackoffTimer::new(BackoffConfig::default());
//!
//! match classifier.classify(ErrorCategory::Timeout) {
//!     FaultKind::Transient => assert_eq!(backoff.get(), Duration::from_millis(25)),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod backoff;
pub mod connection_pool;
pub mod dead_letter;
pub mod error;
pub mod fault;

// Re-export main types for convenience
pub use backoff::{BackoffConfig, BackoffTimer};
pub use connection_pool::{ConnectionFactory, LaneHandle, LanePool, PoolStats};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats};
pub use error::ResilienceError;
pub use fault::{ErrorCategory, FaultClassifier, FaultKind, StaticFaultClassifier};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use pump_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffConfig, BackoffTimer};
    pub use super::connection_pool::{ConnectionFactory, LaneHandle, LanePool};
    pub use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
    pub use super::error::ResilienceError;
    pub use super::fault::{ErrorCategory, FaultClassifier, FaultKind, StaticFaultClassifier};
}
