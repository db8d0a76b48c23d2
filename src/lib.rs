/*!
 * Relay Pump - resilient at-least-once message relay
 *
 * Continuously moves messages from a source queue to a destination queue:
 * - Parallel lanes, each with its own receiver/sender connection
 * - Send-before-complete ordering for at-least-once delivery
 * - Exponential backoff per failure domain on transient faults
 * - Dead-lettering of messages that can never be delivered
 * - Cooperative shutdown observed from every lane state
 * - In-memory broker and fault injection for testing
 */

pub mod config;
pub mod endpoint;
pub mod error;
pub mod fault_injection;
pub mod lane;
pub mod logging;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod pump;
pub mod throughput;

// Re-export commonly used types
pub use config::{BackoffSettings, LogLevel, PumpConfig};
pub use endpoint::{
    DestinationEndpoint, EndpointError, EntityManager, MessageReceiver, MessageSender,
    QueueOptions, SourceEndpoint,
};
pub use error::{PumpError, Result};
pub use lane::{LaneConnection, LaneExit, LaneSettings, LaneState, LaneStats, PumpLane, Stage};
pub use memory::{InMemoryBroker, JournalEntry};
pub use message::{LockToken, Message, PropertyValue, ReceivedMessage};
pub use metrics::PumpMetrics;
pub use pump::{MessagePump, PumpReport};
pub use throughput::{ThroughputMeter, ThroughputSnapshot};

pub use pump_core_resilience::{
    BackoffConfig, BackoffTimer, ErrorCategory, FaultClassifier, FaultKind, StaticFaultClassifier,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
