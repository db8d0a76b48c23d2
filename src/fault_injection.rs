/*!
 * Fault injection for endpoints
 *
 * Wraps a source or destination endpoint and fails selected operations
 * according to a plan. Used by the test suite and the demo command to
 * drive the pump through its retry and dead-letter paths.
 *
 * A rule with `FaultTiming::After` lets the inner operation succeed and
 * still reports the error, which reproduces a lost acknowledgement: the
 * work happened but the caller was told it did not.
 */

use crate::endpoint::{
    DestinationEndpoint, EndpointError, MessageReceiver, MessageSender, SourceEndpoint,
};
use crate::message::{LockToken, Message, ReceivedMessage};
use async_trait::async_trait;
use pump_core_resilience::ErrorCategory;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Endpoint operation a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Receive,
    Send,
    Complete,
    DeadLetter,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Receive,
        Operation::Send,
        Operation::Complete,
        Operation::DeadLetter,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Receive => f.write_str("receive"),
            Operation::Send => f.write_str("send"),
            Operation::Complete => f.write_str("complete"),
            Operation::DeadLetter => f.write_str("dead_letter"),
        }
    }
}

/// When a rule fires
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Only the n-th call (1-based)
    NthCall(u64),
    /// Every n-th call
    EveryNth(u64),
    /// Each call with the given probability
    Probability(f64),
    /// Sends whose message label matches
    LabelEquals(String),
    Always,
}

impl Trigger {
    fn fires(&self, call: u64, label: Option<&str>) -> bool {
        match self {
            Trigger::NthCall(n) => call == *n,
            Trigger::EveryNth(n) => *n > 0 && call % n == 0,
            Trigger::Probability(p) => rand::rng().random_bool(p.clamp(0.0, 1.0)),
            Trigger::LabelEquals(expected) => label == Some(expected.as_str()),
            Trigger::Always => true,
        }
    }
}

/// Whether the inner operation runs before the error is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultTiming {
    #[default]
    Before,
    After,
}

/// One injected failure
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub operation: Operation,
    pub trigger: Trigger,
    pub category: ErrorCategory,
    pub timing: FaultTiming,
}

/// Ordered set of rules; the first matching rule wins
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    rules: Vec<FaultRule>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, operation: Operation, trigger: Trigger, category: ErrorCategory) -> Self {
        self.rules.push(FaultRule {
            operation,
            trigger,
            category,
            timing: FaultTiming::Before,
        });
        self
    }

    /// Run the operation, then report `category` anyway
    pub fn fail_after(
        mut self,
        operation: Operation,
        trigger: Trigger,
        category: ErrorCategory,
    ) -> Self {
        self.rules.push(FaultRule {
            operation,
            trigger,
            category,
            timing: FaultTiming::After,
        });
        self
    }

    pub fn rules(&self) -> &[FaultRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    calls: AtomicU64,
    injected: AtomicU64,
}

/// Evaluates a plan and counts calls per operation
#[derive(Debug)]
pub struct FaultInjector {
    plan: FaultPlan,
    counters: HashMap<Operation, OpCounters>,
}

impl FaultInjector {
    pub fn new(plan: FaultPlan) -> Self {
        let counters = Operation::ALL
            .iter()
            .map(|op| (*op, OpCounters::default()))
            .collect();
        Self { plan, counters }
    }

    fn counter(&self, operation: Operation) -> Option<&OpCounters> {
        self.counters.get(&operation)
    }

    /// Count a call and return the rule to apply, if any
    fn on_call(&self, operation: Operation, label: Option<&str>) -> Option<(ErrorCategory, FaultTiming)> {
        let counter = self.counter(operation)?;
        let call = counter.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let rule = self
            .plan
            .rules
            .iter()
            .filter(|rule| rule.operation == operation)
            .find(|rule| rule.trigger.fires(call, label))?;

        counter.injected.fetch_add(1, Ordering::SeqCst);
        debug!(%operation, call, category = %rule.category, "Injecting fault");
        Some((rule.category, rule.timing))
    }

    /// Calls seen for an operation
    pub fn calls(&self, operation: Operation) -> u64 {
        self.counter(operation)
            .map_or(0, |c| c.calls.load(Ordering::SeqCst))
    }

    /// Faults injected for an operation
    pub fn injected(&self, operation: Operation) -> u64 {
        self.counter(operation)
            .map_or(0, |c| c.injected.load(Ordering::SeqCst))
    }

    fn error(operation: Operation, category: ErrorCategory) -> EndpointError {
        EndpointError::new(category, format!("injected {} fault", operation))
    }

    async fn run<T, F>(
        &self,
        operation: Operation,
        label: Option<&str>,
        inner: F,
    ) -> Result<T, EndpointError>
    where
        F: std::future::Future<Output = Result<T, EndpointError>>,
    {
        match self.on_call(operation, label) {
            None => inner.await,
            Some((category, FaultTiming::Before)) => Err(Self::error(operation, category)),
            Some((category, FaultTiming::After)) => {
                inner.await?;
                Err(Self::error(operation, category))
            }
        }
    }
}

/// Source endpoint whose receivers fail according to a plan
pub struct FaultySource {
    inner: Arc<dyn SourceEndpoint>,
    injector: Arc<FaultInjector>,
}

impl FaultySource {
    pub fn new(inner: Arc<dyn SourceEndpoint>, plan: FaultPlan) -> Self {
        Self {
            inner,
            injector: Arc::new(FaultInjector::new(plan)),
        }
    }

    pub fn injector(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.injector)
    }
}

#[async_trait]
impl SourceEndpoint for FaultySource {
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn open_receiver(
        &self,
        prefetch_count: usize,
    ) -> Result<Box<dyn MessageReceiver>, EndpointError> {
        let inner = self.inner.open_receiver(prefetch_count).await?;
        Ok(Box::new(FaultyReceiver {
            inner,
            injector: Arc::clone(&self.injector),
        }))
    }
}

/// Destination endpoint whose senders fail according to a plan
pub struct FaultyDestination {
    inner: Arc<dyn DestinationEndpoint>,
    injector: Arc<FaultInjector>,
}

impl FaultyDestination {
    pub fn new(inner: Arc<dyn DestinationEndpoint>, plan: FaultPlan) -> Self {
        Self {
            inner,
            injector: Arc::new(FaultInjector::new(plan)),
        }
    }

    pub fn injector(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.injector)
    }
}

#[async_trait]
impl DestinationEndpoint for FaultyDestination {
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn open_sender(&self) -> Result<Box<dyn MessageSender>, EndpointError> {
        let inner = self.inner.open_sender().await?;
        Ok(Box::new(FaultySender {
            inner,
            injector: Arc::clone(&self.injector),
        }))
    }
}

pub struct FaultyReceiver {
    inner: Box<dyn MessageReceiver>,
    injector: Arc<FaultInjector>,
}

#[async_trait]
impl MessageReceiver for FaultyReceiver {
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, EndpointError> {
        self.injector
            .run(Operation::Receive, None, self.inner.receive(timeout))
            .await
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), EndpointError> {
        self.injector
            .run(Operation::Complete, None, self.inner.complete(lock_token))
            .await
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), EndpointError> {
        self.injector
            .run(
                Operation::DeadLetter,
                None,
                self.inner.dead_letter(lock_token, reason, description),
            )
            .await
    }

    async fn peek(&self, max_count: usize) -> Result<Vec<Message>, EndpointError> {
        self.inner.peek(max_count).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pub struct FaultySender {
    inner: Box<dyn MessageSender>,
    injector: Arc<FaultInjector>,
}

#[async_trait]
impl MessageSender for FaultySender {
    async fn send(&self, message: Message) -> Result<(), EndpointError> {
        let label = message.label.clone();
        self.injector
            .run(Operation::Send, Some(label.as_str()), self.inner.send(message))
            .await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
