/*!
 * Message envelope relayed by the pump
 */

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Scalar value of a message property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// An outgoing or received message
///
/// Carries only what the sender supplied. Anything the broker assigns on
/// receipt (lock token, delivery count, sequence number) lives on
/// [`ReceivedMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender-assigned identifier
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Opaque payload
    pub body: Bytes,

    /// Application properties
    pub properties: HashMap<String, PropertyValue>,

    /// How long the message stays deliverable once enqueued
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Create a message with a fresh random id
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: String::new(),
            body: body.into(),
            properties: HashMap::new(),
            time_to_live: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Independent copy for re-transmission to another endpoint
    ///
    /// Keeps id, label, properties, body and time-to-live. The destination
    /// assigns its own broker state when the copy is sent.
    pub fn clone_for_resend(&self) -> Message {
        Message {
            id: self.id.clone(),
            label: self.label.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            time_to_live: self.time_to_live,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Opaque handle identifying one locked delivery of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        LockToken(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as handed out by a source endpoint
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,

    /// Present for lock-based receives; required to complete or dead-letter
    pub lock_token: Option<LockToken>,

    /// When the lock expires and the broker may redeliver
    pub locked_until: Option<Instant>,

    /// Number of times this message has been handed out, including this one
    pub delivery_count: u32,

    /// Broker-assigned position in the source queue
    pub sequence_number: u64,
}

impl ReceivedMessage {
    /// Whether the lock is still held at `now`
    pub fn is_lock_valid(&self, now: Instant) -> bool {
        match self.locked_until {
            Some(until) => now < until,
            None => true,
        }
    }
}
