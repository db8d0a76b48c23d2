/*!
 * In-memory message broker
 *
 * A complete lock-based queue implementation behind the endpoint traits:
 * peek-lock receives with expiring locks, redelivery with delivery counts,
 * time-to-live, a dead-letter store per queue, and prefetching receivers.
 *
 * Every send, complete and dead-letter is also appended to an ordered,
 * bounded journal so callers can check the relative order of operations
 * across queues.
 */

use crate::endpoint::{
    DestinationEndpoint, EndpointError, EntityManager, MessageReceiver, MessageSender,
    QueueOptions, SourceEndpoint,
};
use crate::message::{LockToken, Message, ReceivedMessage};
use async_trait::async_trait;
use pump_core_resilience::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats, ErrorCategory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Longest a waiting receive sleeps before re-checking for expired locks
const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Journal entries kept before the oldest are discarded
pub const DEFAULT_JOURNAL_CAPACITY: usize = 100_000;

/// Reason used when the broker itself dead-letters a message
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// One recorded broker operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Sent { queue: String, message_id: String },
    Completed { queue: String, message_id: String },
    DeadLettered { queue: String, message_id: String, reason: String },
}

/// Ring of the most recent journal entries
#[derive(Debug)]
struct Journal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
}

impl Journal {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, entry: JournalEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    sequence_number: u64,
    delivery_count: u32,
    enqueued_at: Instant,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct LockedMessage {
    stored: StoredMessage,
    locked_until: Instant,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    available: VecDeque<StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    dead_letters: DeadLetterQueue<Message>,
    expired: u64,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            dead_letters: DeadLetterQueue::new(options.dead_letter_capacity),
            options,
            available: VecDeque::new(),
            locked: HashMap::new(),
            expired: 0,
        }
    }

    /// Return expired locks to the queue and drop expired messages
    fn reclaim(&mut self, now: Instant, queue: &str, journal: &mut Journal) {
        let expired_tokens: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired_tokens {
            let Some(locked) = self.locked.remove(&token) else {
                continue;
            };
            let stored = locked.stored;

            if stored.delivery_count >= self.options.max_delivery_count {
                debug!(
                    queue,
                    message_id = %stored.message.id,
                    deliveries = stored.delivery_count,
                    "Lock expired on last allowed delivery, dead-lettering"
                );
                journal.push(JournalEntry::DeadLettered {
                    queue: queue.to_string(),
                    message_id: stored.message.id.clone(),
                    reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
                });
                let description = format!("delivered {} times", stored.delivery_count);
                self.dead_letters.push(DeadLetterEntry::new(
                    stored.message.id.clone(),
                    stored.message,
                    MAX_DELIVERY_COUNT_EXCEEDED,
                    description,
                ));
            } else {
                trace!(queue, message_id = %stored.message.id, "Lock expired, redelivering");
                self.available.push_front(stored);
            }
        }

        let before = self.available.len();
        self.available
            .retain(|m| m.expires_at.map_or(true, |at| now < at));
        self.expired += (before - self.available.len()) as u64;
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    journal: Journal,
    next_sequence: u64,
}

impl BrokerState {
    fn queue_mut(&mut self, path: &str) -> Result<&mut QueueState, EndpointError> {
        self.queues
            .get_mut(path)
            .ok_or_else(|| EndpointError::entity_not_found(path))
    }

    /// Reclaim expired locks on one queue and hand back the queue and journal
    fn prepared(
        &mut self,
        path: &str,
        now: Instant,
    ) -> Result<(&mut QueueState, &mut Journal), EndpointError> {
        let BrokerState { queues, journal, .. } = self;
        let queue = queues
            .get_mut(path)
            .ok_or_else(|| EndpointError::entity_not_found(path))?;
        queue.reclaim(now, path, journal);
        Ok((queue, journal))
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

/// Shared in-memory broker; clones refer to the same queues
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose journal keeps at most `capacity` entries; 0 disables it
    pub fn with_journal_capacity(capacity: usize) -> Self {
        let state = BrokerState {
            journal: Journal::new(capacity),
            ..Default::default()
        };
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(state),
                arrivals: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Source endpoint reading from `path`
    pub fn source(&self, path: impl Into<String>) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            path: path.into(),
        }
    }

    /// Destination endpoint writing to `path`
    pub fn destination(&self, path: impl Into<String>) -> MemoryDestination {
        MemoryDestination {
            broker: self.clone(),
            path: path.into(),
        }
    }

    /// Enqueue a message
    pub fn send(&self, path: &str, message: Message) -> Result<(), EndpointError> {
        let mut state = self.state();
        let sequence_number = state.next_sequence;
        let queue = state.queue_mut(path)?;

        if message.size() > queue.options.max_message_size {
            return Err(EndpointError::new(
                ErrorCategory::MessageTooLarge,
                format!(
                    "message {} is {} bytes, limit is {}",
                    message.id,
                    message.size(),
                    queue.options.max_message_size
                ),
            ));
        }

        let now = Instant::now();
        let ttl = message.time_to_live.or(queue.options.default_time_to_live);
        let message_id = message.id.clone();
        queue.available.push_back(StoredMessage {
            message,
            sequence_number,
            delivery_count: 0,
            enqueued_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        });

        state.next_sequence += 1;
        state.journal.push(JournalEntry::Sent {
            queue: path.to_string(),
            message_id,
        });
        drop(state);

        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    /// Lock and return up to `max_count` messages without waiting
    fn try_receive_batch(
        &self,
        path: &str,
        max_count: usize,
    ) -> Result<Vec<ReceivedMessage>, EndpointError> {
        let now = Instant::now();
        let mut state = self.state();
        let (queue, _) = state.prepared(path, now)?;

        let lock_duration = queue.options.lock_duration;
        let mut batch = Vec::new();
        while batch.len() < max_count {
            let Some(mut stored) = queue.available.pop_front() else {
                break;
            };
            stored.delivery_count += 1;

            let token = LockToken::new();
            let locked_until = now + lock_duration;
            batch.push(ReceivedMessage {
                message: stored.message.clone(),
                lock_token: Some(token),
                locked_until: Some(locked_until),
                delivery_count: stored.delivery_count,
                sequence_number: stored.sequence_number,
            });
            queue.locked.insert(token, LockedMessage { stored, locked_until });
        }

        Ok(batch)
    }

    /// Wait up to `timeout` for at least one message, then lock up to `max_count`
    pub async fn receive_batch(
        &self,
        path: &str,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, EndpointError> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.try_receive_batch(path, max_count.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wait = (deadline - now).min(RECHECK_INTERVAL);
            tokio::select! {
                _ = self.inner.arrivals.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Acknowledge a locked message
    pub fn complete(&self, path: &str, token: &LockToken) -> Result<(), EndpointError> {
        let mut state = self.state();
        let (queue, journal) = state.prepared(path, Instant::now())?;

        let locked = queue
            .locked
            .remove(token)
            .ok_or_else(|| EndpointError::lock_lost(token))?;

        journal.push(JournalEntry::Completed {
            queue: path.to_string(),
            message_id: locked.stored.message.id,
        });
        Ok(())
    }

    /// Move a locked message to the queue's dead-letter store
    pub fn dead_letter(
        &self,
        path: &str,
        token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), EndpointError> {
        let mut state = self.state();
        let (queue, journal) = state.prepared(path, Instant::now())?;

        let locked = queue
            .locked
            .remove(token)
            .ok_or_else(|| EndpointError::lock_lost(token))?;
        let message = locked.stored.message;

        journal.push(JournalEntry::DeadLettered {
            queue: path.to_string(),
            message_id: message.id.clone(),
            reason: reason.to_string(),
        });
        queue.dead_letters.push(DeadLetterEntry::new(
            message.id.clone(),
            message,
            reason,
            description,
        ));
        Ok(())
    }

    /// Available messages in queue order, without locking them
    pub fn peek(&self, path: &str, max_count: usize) -> Result<Vec<Message>, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue
            .available
            .iter()
            .take(max_count)
            .map(|m| m.message.clone())
            .collect())
    }

    /// Available plus locked messages
    pub fn active_count(&self, path: &str) -> Result<usize, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue.available.len() + queue.locked.len())
    }

    /// Messages in the dead-letter store, oldest first
    pub fn dead_letters(&self, path: &str) -> Result<Vec<DeadLetterEntry<Message>>, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue.dead_letters.entries().iter().cloned().collect())
    }

    /// Dead-letter store counters, including entries lost to overflow
    pub fn dead_letter_stats(&self, path: &str) -> Result<DeadLetterStats, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue.dead_letters.stats())
    }

    /// Messages dropped because their time-to-live ran out
    pub fn expired_count(&self, path: &str) -> Result<u64, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue.expired)
    }

    /// Age of the oldest available message
    pub fn oldest_age(&self, path: &str) -> Result<Option<Duration>, EndpointError> {
        let mut state = self.state();
        let (queue, _) = state.prepared(path, Instant::now())?;
        Ok(queue.available.front().map(|m| m.enqueued_at.elapsed()))
    }

    /// Snapshot of the operation journal, oldest retained entry first
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state().journal.entries.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.state().journal.entries.clear();
    }
}

#[async_trait]
impl EntityManager for InMemoryBroker {
    async fn create_queue(&self, path: &str, options: QueueOptions) -> Result<(), EndpointError> {
        let mut state = self.state();
        if state.queues.contains_key(path) {
            return Err(EndpointError::new(
                ErrorCategory::InvalidArgument,
                format!("entity '{}' already exists", path),
            ));
        }
        state.queues.insert(path.to_string(), QueueState::new(options));
        debug!(queue = path, "Created queue");
        Ok(())
    }

    async fn delete_queue(&self, path: &str) -> Result<(), EndpointError> {
        let mut state = self.state();
        state
            .queues
            .remove(path)
            .map(|_| debug!(queue = path, "Deleted queue"))
            .ok_or_else(|| EndpointError::entity_not_found(path))
    }

    async fn queue_exists(&self, path: &str) -> Result<bool, EndpointError> {
        Ok(self.state().queues.contains_key(path))
    }
}

/// Source endpoint over an in-memory queue
#[derive(Debug, Clone)]
pub struct MemorySource {
    broker: InMemoryBroker,
    path: String,
}

#[async_trait]
impl SourceEndpoint for MemorySource {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open_receiver(
        &self,
        prefetch_count: usize,
    ) -> Result<Box<dyn MessageReceiver>, EndpointError> {
        if !self.broker.queue_exists(&self.path).await? {
            return Err(EndpointError::entity_not_found(&self.path));
        }
        Ok(Box::new(MemoryReceiver {
            broker: self.broker.clone(),
            path: self.path.clone(),
            prefetch_count,
            buffer: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Destination endpoint over an in-memory queue
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    broker: InMemoryBroker,
    path: String,
}

#[async_trait]
impl DestinationEndpoint for MemoryDestination {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open_sender(&self) -> Result<Box<dyn MessageSender>, EndpointError> {
        if !self.broker.queue_exists(&self.path).await? {
            return Err(EndpointError::entity_not_found(&self.path));
        }
        Ok(Box::new(MemorySender {
            broker: self.broker.clone(),
            path: self.path.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Receiver with a local prefetch buffer
///
/// Prefetched messages are locked when fetched. A buffered message whose
/// lock ran out before it was handed over is skipped; the broker has already
/// made it available again.
#[derive(Debug)]
pub struct MemoryReceiver {
    broker: InMemoryBroker,
    path: String,
    prefetch_count: usize,
    buffer: Mutex<VecDeque<ReceivedMessage>>,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn ensure_open(&self) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EndpointError::shutdown(format!(
                "receiver for '{}' is closed",
                self.path
            )));
        }
        Ok(())
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<ReceivedMessage>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_buffered(&self) -> Option<ReceivedMessage> {
        let now = Instant::now();
        let mut buffer = self.buffer();
        while let Some(received) = buffer.pop_front() {
            if received.is_lock_valid(now) {
                return Some(received);
            }
        }
        None
    }

    /// Messages fetched but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, EndpointError> {
        self.ensure_open()?;

        if let Some(received) = self.pop_buffered() {
            return Ok(Some(received));
        }

        let mut batch = self
            .broker
            .receive_batch(&self.path, 1 + self.prefetch_count, timeout)
            .await?
            .into_iter();

        let first = batch.next();
        self.buffer().extend(batch);
        Ok(first)
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), EndpointError> {
        self.ensure_open()?;
        self.broker.complete(&self.path, lock_token)
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        reason: &str,
        description: &str,
    ) -> Result<(), EndpointError> {
        self.ensure_open()?;
        self.broker
            .dead_letter(&self.path, lock_token, reason, description)
    }

    async fn peek(&self, max_count: usize) -> Result<Vec<Message>, EndpointError> {
        self.ensure_open()?;
        self.broker.peek(&self.path, max_count)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let abandoned = {
            let mut buffer = self.buffer();
            let n = buffer.len();
            buffer.clear();
            n
        };
        if abandoned > 0 {
            debug!(
                queue = %self.path,
                abandoned,
                "Closed receiver, prefetched messages left to lock expiry"
            );
        }
    }
}

/// Sender over an in-memory queue
#[derive(Debug)]
pub struct MemorySender {
    broker: InMemoryBroker,
    path: String,
    closed: AtomicBool,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&self, message: Message) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EndpointError::shutdown(format!(
                "sender for '{}' is closed",
                self.path
            )));
        }
        self.broker.send(&self.path, message)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
