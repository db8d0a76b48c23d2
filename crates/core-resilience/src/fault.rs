//! Fault classification for endpoint operation failures
//!
//! Every failure raised by a source or destination operation carries an
//! [`ErrorCategory`]. A [`FaultClassifier`] maps that category to the
//! [`FaultKind`] that decides what the caller does next:
//!
//! - **Transient**: wait out a backoff interval and retry the same operation
//! - **Permanent**: give up on this item (dead-letter it, or move on)
//! - **Cancellation**: stop immediately, no retry and no dead-letter
//!
//! The default mapping is static. Individual categories can be overridden,
//! which lets tests and deployments inject their own policy without touching
//! the caller.

use std::collections::HashMap;
use std::fmt;

/// Broad category of an endpoint failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Operation did not finish within its deadline
    Timeout,
    /// Endpoint is throttling the caller
    ServerBusy,
    /// Endpoint is temporarily unreachable
    Unavailable,
    /// Transport-level failure (connection reset, broken pipe)
    Communication,
    /// Request arguments were rejected
    InvalidArgument,
    /// Queue or topic does not exist
    EntityNotFound,
    /// Caller is not allowed to perform the operation
    Unauthorized,
    /// Message exceeds the endpoint's size limit
    MessageTooLarge,
    /// Message content cannot be accepted
    MalformedMessage,
    /// Lock token is unknown or already expired
    LockLost,
    /// Endpoint or pump is shutting down
    Shutdown,
    /// Anything the endpoint could not categorize
    Unknown,
}

impl ErrorCategory {
    /// All categories, in declaration order
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::Timeout,
        ErrorCategory::ServerBusy,
        ErrorCategory::Unavailable,
        ErrorCategory::Communication,
        ErrorCategory::InvalidArgument,
        ErrorCategory::EntityNotFound,
        ErrorCategory::Unauthorized,
        ErrorCategory::MessageTooLarge,
        ErrorCategory::MalformedMessage,
        ErrorCategory::LockLost,
        ErrorCategory::Shutdown,
        ErrorCategory::Unknown,
    ];
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerBusy => "server busy",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Communication => "communication failure",
            ErrorCategory::InvalidArgument => "invalid argument",
            ErrorCategory::EntityNotFound => "entity not found",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::MessageTooLarge => "message too large",
            ErrorCategory::MalformedMessage => "malformed message",
            ErrorCategory::LockLost => "lock lost",
            ErrorCategory::Shutdown => "shutdown",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What the caller should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Retry the same operation after a backoff delay
    Transient,
    /// The operation can never succeed for this item
    Permanent,
    /// Shutting down; abandon work immediately
    Cancellation,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Transient => f.write_str("transient"),
            FaultKind::Permanent => f.write_str("permanent"),
            FaultKind::Cancellation => f.write_str("cancellation"),
        }
    }
}

/// Maps an error category to a fault kind
pub trait FaultClassifier: Send + Sync + fmt::Debug {
    /// Classify a failure of the given category
    fn classify(&self, category: ErrorCategory) -> FaultKind;
}

/// Static category mapping with optional per-category overrides
///
/// # Example
/// ```
/// use pump_core_resilience::fault::{ErrorCategory, FaultClassifier, FaultKind, StaticFaultClassifier};
///
/// let classifier = StaticFaultClassifier::new()
///     .with_override(ErrorCategory::Unauthorized, FaultKind::Transient);
///
/// assert_eq!(classifier.classify(ErrorCategory::Timeout), FaultKind::Transient);
/// assert_eq!(classifier.classify(ErrorCategory::Unauthorized), FaultKind::Transient);
/// assert_eq!(classifier.classify(ErrorCategory::EntityNotFound), FaultKind::Permanent);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticFaultClassifier {
    overrides: HashMap<ErrorCategory, FaultKind>,
}

impl StaticFaultClassifier {
    /// Create a classifier using only the default mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outcome for a single category
    pub fn with_override(mut self, category: ErrorCategory, kind: FaultKind) -> Self {
        self.overrides.insert(category, kind);
        self
    }

    /// The built-in mapping, ignoring overrides
    pub fn default_kind(category: ErrorCategory) -> FaultKind {
        match category {
            ErrorCategory::Timeout
            | ErrorCategory::ServerBusy
            | ErrorCategory::Unavailable
            | ErrorCategory::Communication
            | ErrorCategory::Unknown => FaultKind::Transient,

            ErrorCategory::InvalidArgument
            | ErrorCategory::EntityNotFound
            | ErrorCategory::Unauthorized
            | ErrorCategory::MessageTooLarge
            | ErrorCategory::MalformedMessage
            | ErrorCategory::LockLost => FaultKind::Permanent,

            ErrorCategory::Shutdown => FaultKind::Cancellation,
        }
    }
}

impl FaultClassifier for StaticFaultClassifier {
    fn classify(&self, category: ErrorCategory) -> FaultKind {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| Self::default_kind(category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_transient() {
        let c = StaticFaultClassifier::new();
        assert_eq!(c.classify(ErrorCategory::Timeout), FaultKind::Transient);
        assert_eq!(c.classify(ErrorCategory::ServerBusy), FaultKind::Transient);
        assert_eq!(c.classify(ErrorCategory::Unavailable), FaultKind::Transient);
    }

    #[test]
    fn test_argument_and_entity_errors_are_permanent() {
        let c = StaticFaultClassifier::new();
        assert_eq!(c.classify(ErrorCategory::InvalidArgument), FaultKind::Permanent);
        assert_eq!(c.classify(ErrorCategory::EntityNotFound), FaultKind::Permanent);
        assert_eq!(c.classify(ErrorCategory::Unauthorized), FaultKind::Permanent);
        assert_eq!(c.classify(ErrorCategory::LockLost), FaultKind::Permanent);
    }

    #[test]
    fn test_shutdown_is_cancellation() {
        let c = StaticFaultClassifier::new();
        assert_eq!(c.classify(ErrorCategory::Shutdown), FaultKind::Cancellation);
    }

    #[test]
    fn test_every_category_is_mapped() {
        let c = StaticFaultClassifier::new();
        let cancellations = ErrorCategory::ALL
            .iter()
            .filter(|cat| c.classify(**cat) == FaultKind::Cancellation)
            .count();
        assert_eq!(cancellations, 1);
    }

    #[test]
    fn test_override_replaces_single_category() {
        let c = StaticFaultClassifier::new()
            .with_override(ErrorCategory::MalformedMessage, FaultKind::Transient);

        assert_eq!(c.classify(ErrorCategory::MalformedMessage), FaultKind::Transient);
        assert_eq!(c.classify(ErrorCategory::MessageTooLarge), FaultKind::Permanent);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCategory::EntityNotFound.to_string(), "entity not found");
        assert_eq!(FaultKind::Cancellation.to_string(), "cancellation");
    }
}
