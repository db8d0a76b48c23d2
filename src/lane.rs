/*!
 * Pump lane: the receive → send → acknowledge state machine
 *
 * A lane owns one receiver/sender pair and relays one message at a time.
 * Every stage is an endpoint call raced against the shutdown token, so a
 * stop request is observed from any state, including a pending backoff.
 *
 * The lane is driven by a plain loop over `LaneState`. Each stage returns
 * the next state instead of calling it, so endpoints that complete
 * synchronously never deepen the stack.
 *
 * ```text
 *            ┌──────────── empty / permanent ───────────┐
 *            ▼                                          │
 *       Receiving ──ok──▶ Sending ──ok──▶ Acknowledging ┤
 *            ▲               │ permanent                │
 *            │               ▼                          │
 *            └──────── DeadLettering ◀──────────────────┘
 *
 *   any transient failure ──▶ Retrying(stage) ──delay──▶ stage
 *   shutdown / cancellation ──▶ Stopped
 * ```
 */

use crate::config::PumpConfig;
use crate::endpoint::{EndpointError, MessageReceiver, MessageSender};
use crate::message::{Message, ReceivedMessage};
use crate::metrics::PumpCounters;
use crate::throughput::ThroughputMeter;
use pump_core_resilience::{BackoffConfig, BackoffTimer, FaultClassifier, FaultKind};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Stage a retry re-enters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Receiving,
    Sending,
    Acknowledging,
    DeadLettering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Receiving => f.write_str("receiving"),
            Stage::Sending => f.write_str("sending"),
            Stage::Acknowledging => f.write_str("acknowledging"),
            Stage::DeadLettering => f.write_str("dead_lettering"),
        }
    }
}

/// Why a message is being dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRequest {
    pub reason: String,
    pub description: String,
}

/// The single in-flight message of a lane
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// The message as received, including its lock token
    pub received: ReceivedMessage,

    /// Independent copy sent to the destination
    pub outgoing: Message,

    /// Set once the message is headed for the dead-letter store
    pub dead_letter: Option<DeadLetterRequest>,
}

impl OperationContext {
    pub fn new(received: ReceivedMessage) -> Self {
        let outgoing = received.message.clone_for_resend();
        Self {
            received,
            outgoing,
            dead_letter: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.received.message.id
    }
}

#[derive(Debug)]
pub enum LaneState {
    Receiving,
    Sending(OperationContext),
    Acknowledging(OperationContext),
    DeadLettering(OperationContext),
    Retrying {
        stage: Stage,
        context: Option<OperationContext>,
        delay: Duration,
    },
    Stopped,
}

impl LaneState {
    /// Re-enter `stage` with the context it was working on
    fn resume(stage: Stage, context: Option<OperationContext>) -> LaneState {
        match (stage, context) {
            (Stage::Sending, Some(ctx)) => LaneState::Sending(ctx),
            (Stage::Acknowledging, Some(ctx)) => LaneState::Acknowledging(ctx),
            (Stage::DeadLettering, Some(ctx)) => LaneState::DeadLettering(ctx),
            _ => LaneState::Receiving,
        }
    }
}

/// Per-lane knobs derived from the pump configuration
#[derive(Debug, Clone)]
pub struct LaneSettings {
    pub receive_timeout: Duration,
    pub source_backoff: BackoffConfig,
    pub destination_backoff: BackoffConfig,
    pub dead_letter_reason: String,
}

impl LaneSettings {
    pub fn from_config(config: &PumpConfig) -> Self {
        Self {
            receive_timeout: config.receive_timeout(),
            source_backoff: config.source_backoff.to_backoff_config(),
            destination_backoff: config.destination_backoff.to_backoff_config(),
            dead_letter_reason: config.dead_letter_reason.clone(),
        }
    }
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self::from_config(&PumpConfig::default())
    }
}

/// Receiver and sender owned by one lane
pub struct LaneConnection {
    pub receiver: Box<dyn MessageReceiver>,
    pub sender: Box<dyn MessageSender>,
}

impl fmt::Debug for LaneConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneConnection").finish_non_exhaustive()
    }
}

/// What a single lane did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub lane: usize,
    pub received: u64,
    pub relayed: u64,
    pub dead_lettered: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
}

/// Returned when a lane stops; the connection goes back to the pool
#[derive(Debug)]
pub struct LaneExit {
    pub stats: LaneStats,
    pub connection: LaneConnection,
}

/// Await `fut` unless shutdown is requested first
async fn until_shutdown<F: Future>(shutdown: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        output = fut => Some(output),
    }
}

pub struct PumpLane {
    id: usize,
    connection: LaneConnection,
    classifier: Arc<dyn FaultClassifier>,
    source_backoff: BackoffTimer,
    destination_backoff: BackoffTimer,
    settings: LaneSettings,
    shutdown: CancellationToken,
    counters: Arc<PumpCounters>,
    meter: Arc<ThroughputMeter>,
    stats: LaneStats,
}

impl PumpLane {
    pub fn new(
        id: usize,
        connection: LaneConnection,
        settings: LaneSettings,
        classifier: Arc<dyn FaultClassifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            connection,
            classifier,
            source_backoff: BackoffTimer::new(settings.source_backoff),
            destination_backoff: BackoffTimer::new(settings.destination_backoff),
            settings,
            shutdown,
            counters: Arc::new(PumpCounters::default()),
            meter: Arc::new(ThroughputMeter::new(None)),
            stats: LaneStats {
                lane: id,
                ..Default::default()
            },
        }
    }

    /// Report into pump-wide counters instead of private ones
    pub fn with_instruments(mut self, counters: Arc<PumpCounters>, meter: Arc<ThroughputMeter>) -> Self {
        self.counters = counters;
        self.meter = meter;
        self
    }

    /// Drive the lane until shutdown
    pub async fn run(self) -> LaneExit {
        let span = info_span!("lane", lane = self.id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> LaneExit {
        debug!("Lane started");

        let mut state = LaneState::Receiving;
        loop {
            if self.shutdown.is_cancelled() {
                if let Some(id) = in_flight(&state) {
                    debug!(message_id = id, "Abandoning in-flight message to lock expiry");
                }
                break;
            }

            state = match state {
                LaneState::Receiving => self.receive().await,
                LaneState::Sending(ctx) => self.send(ctx).await,
                LaneState::Acknowledging(ctx) => self.acknowledge(ctx).await,
                LaneState::DeadLettering(ctx) => self.dead_letter(ctx).await,
                LaneState::Retrying {
                    stage,
                    context,
                    delay,
                } => match until_shutdown(&self.shutdown, tokio::time::sleep(delay)).await {
                    Some(()) => {
                        trace!(%stage, "Backoff elapsed");
                        LaneState::resume(stage, context)
                    }
                    None => LaneState::Stopped,
                },
                LaneState::Stopped => break,
            };
        }

        debug!(
            relayed = self.stats.relayed,
            dead_lettered = self.stats.dead_lettered,
            "Lane stopped"
        );
        LaneExit {
            stats: self.stats,
            connection: self.connection,
        }
    }

    fn classify(&self, error: &EndpointError) -> FaultKind {
        if self.shutdown.is_cancelled() {
            return FaultKind::Cancellation;
        }
        self.classifier.classify(error.category)
    }

    /// Schedule a retry of `stage` after the backoff for its failure domain
    fn retry(&mut self, stage: Stage, context: Option<OperationContext>, error: &EndpointError) -> LaneState {
        if self.shutdown.is_cancelled() {
            return LaneState::Stopped;
        }

        let delay = match stage {
            Stage::Sending => self.destination_backoff.get(),
            Stage::Receiving | Stage::Acknowledging | Stage::DeadLettering => {
                self.source_backoff.get()
            }
        };

        self.stats.transient_failures += 1;
        self.counters.transient_retry();
        debug!(
            %stage,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );

        LaneState::Retrying {
            stage,
            context,
            delay,
        }
    }

    fn permanent_failure(&mut self) {
        self.stats.permanent_failures += 1;
        self.counters.permanent_failure();
    }

    async fn receive(&mut self) -> LaneState {
        let receiving = self.connection.receiver.receive(self.settings.receive_timeout);
        let Some(result) = until_shutdown(&self.shutdown, receiving).await else {
            return LaneState::Stopped;
        };

        match result {
            Ok(Some(received)) => {
                self.source_backoff.reset();
                self.stats.received += 1;
                self.counters.received();
                trace!(
                    message_id = %received.message.id,
                    delivery_count = received.delivery_count,
                    "Received message"
                );
                LaneState::Sending(OperationContext::new(received))
            }
            Ok(None) => {
                self.source_backoff.reset();
                self.counters.empty_poll();
                tokio::task::yield_now().await;
                LaneState::Receiving
            }
            Err(e) => match self.classify(&e) {
                FaultKind::Transient => self.retry(Stage::Receiving, None, &e),
                FaultKind::Permanent => {
                    self.permanent_failure();
                    warn!(error = %e, "Receive failed, polling again");
                    tokio::task::yield_now().await;
                    LaneState::Receiving
                }
                FaultKind::Cancellation => LaneState::Stopped,
            },
        }
    }

    async fn send(&mut self, context: OperationContext) -> LaneState {
        let sending = self.connection.sender.send(context.outgoing.clone());
        let Some(result) = until_shutdown(&self.shutdown, sending).await else {
            return LaneState::Stopped;
        };

        match result {
            Ok(()) => {
                self.destination_backoff.reset();
                self.counters.sent();
                trace!(message_id = context.message_id(), "Sent message");
                LaneState::Acknowledging(context)
            }
            Err(e) => match self.classify(&e) {
                FaultKind::Transient => self.retry(Stage::Sending, Some(context), &e),
                FaultKind::Permanent => {
                    self.permanent_failure();
                    warn!(
                        message_id = context.message_id(),
                        error = %e,
                        "Send failed permanently, dead-lettering"
                    );
                    let mut context = context;
                    context.dead_letter = Some(DeadLetterRequest {
                        reason: self.settings.dead_letter_reason.clone(),
                        description: format!("send to destination failed: {}", e),
                    });
                    LaneState::DeadLettering(context)
                }
                FaultKind::Cancellation => LaneState::Stopped,
            },
        }
    }

    fn relayed(&mut self) {
        self.stats.relayed += 1;
        self.counters.completed();
        self.meter.record();
    }

    async fn acknowledge(&mut self, context: OperationContext) -> LaneState {
        // Receive-and-delete deliveries are settled by the receive itself
        let Some(token) = context.received.lock_token else {
            self.source_backoff.reset();
            self.relayed();
            return LaneState::Receiving;
        };

        let completing = self.connection.receiver.complete(&token);
        let Some(result) = until_shutdown(&self.shutdown, completing).await else {
            return LaneState::Stopped;
        };

        match result {
            Ok(()) => {
                self.source_backoff.reset();
                self.relayed();
                trace!(message_id = context.message_id(), "Completed message");
                LaneState::Receiving
            }
            Err(e) => match self.classify(&e) {
                FaultKind::Transient => self.retry(Stage::Acknowledging, Some(context), &e),
                FaultKind::Permanent => {
                    self.permanent_failure();
                    warn!(
                        message_id = context.message_id(),
                        error = %e,
                        "Complete failed, message will be redelivered after lock expiry"
                    );
                    LaneState::Receiving
                }
                FaultKind::Cancellation => LaneState::Stopped,
            },
        }
    }

    async fn dead_letter(&mut self, context: OperationContext) -> LaneState {
        let Some(token) = context.received.lock_token else {
            warn!(
                message_id = context.message_id(),
                "Message was received without a lock and cannot be dead-lettered"
            );
            return LaneState::Receiving;
        };

        let request = context.dead_letter.clone().unwrap_or_else(|| DeadLetterRequest {
            reason: self.settings.dead_letter_reason.clone(),
            description: String::new(),
        });

        let dead_lettering = self.connection.receiver.dead_letter(
            &token,
            &request.reason,
            &request.description,
        );
        let Some(result) = until_shutdown(&self.shutdown, dead_lettering).await else {
            return LaneState::Stopped;
        };

        match result {
            Ok(()) => {
                self.source_backoff.reset();
                self.stats.dead_lettered += 1;
                self.counters.dead_lettered();
                info!(
                    message_id = context.message_id(),
                    reason = %request.reason,
                    "Dead-lettered message"
                );
                LaneState::Receiving
            }
            Err(e) => match self.classify(&e) {
                FaultKind::Transient => self.retry(Stage::DeadLettering, Some(context), &e),
                FaultKind::Permanent => {
                    // Already settled, usually by an earlier attempt whose reply was lost
                    debug!(
                        message_id = context.message_id(),
                        error = %e,
                        "Dead-letter rejected, moving on"
                    );
                    LaneState::Receiving
                }
                FaultKind::Cancellation => LaneState::Stopped,
            },
        }
    }
}

fn in_flight(state: &LaneState) -> Option<&str> {
    match state {
        LaneState::Sending(ctx) | LaneState::Acknowledging(ctx) | LaneState::DeadLettering(ctx) => {
            Some(ctx.message_id())
        }
        LaneState::Retrying {
            context: Some(ctx), ..
        } => Some(ctx.message_id()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LockToken;
    use async_trait::async_trait;
    use pump_core_resilience::{ErrorCategory, StaticFaultClassifier};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted endpoint: each call pops the next outcome, defaulting to success
    #[derive(Default)]
    struct Script {
        receives: Mutex<VecDeque<Result<Option<ReceivedMessage>, EndpointError>>>,
        sends: Mutex<VecDeque<Result<(), EndpointError>>>,
        completes: Mutex<VecDeque<Result<(), EndpointError>>>,
        log: Mutex<Vec<String>>,
    }

    struct ScriptedReceiver(Arc<Script>);
    struct ScriptedSender(Arc<Script>);

    #[async_trait]
    impl MessageReceiver for ScriptedReceiver {
        async fn receive(&self, _timeout: Duration) -> Result<Option<ReceivedMessage>, EndpointError> {
            let next = self.0.receives.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(EndpointError::shutdown("script exhausted")))
        }

        async fn complete(&self, _lock_token: &LockToken) -> Result<(), EndpointError> {
            self.0.log.lock().unwrap().push("complete".into());
            self.0.completes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn dead_letter(
            &self,
            _lock_token: &LockToken,
            reason: &str,
            _description: &str,
        ) -> Result<(), EndpointError> {
            self.0.log.lock().unwrap().push(format!("dead_letter:{}", reason));
            Ok(())
        }

        async fn peek(&self, _max_count: usize) -> Result<Vec<Message>, EndpointError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(&self, message: Message) -> Result<(), EndpointError> {
            self.0.log.lock().unwrap().push(format!("send:{}", message.id));
            self.0.sends.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn locked(id: &str) -> ReceivedMessage {
        ReceivedMessage {
            message: Message::new("body").with_id(id),
            lock_token: Some(LockToken::new()),
            locked_until: None,
            delivery_count: 1,
            sequence_number: 0,
        }
    }

    fn fast_settings() -> LaneSettings {
        let backoff = BackoffConfig {
            min: Duration::from_millis(1),
            max: Duration::from_millis(4),
        };
        LaneSettings {
            receive_timeout: Duration::from_millis(1),
            source_backoff: backoff,
            destination_backoff: backoff,
            dead_letter_reason: "RelayFailed".into(),
        }
    }

    fn lane(script: &Arc<Script>) -> PumpLane {
        PumpLane::new(
            0,
            LaneConnection {
                receiver: Box::new(ScriptedReceiver(Arc::clone(script))),
                sender: Box::new(ScriptedSender(Arc::clone(script))),
            },
            fast_settings(),
            Arc::new(StaticFaultClassifier::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_happy_path_sends_before_complete() {
        let script = Arc::new(Script::default());
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.relayed, 1);
        assert_eq!(*script.log.lock().unwrap(), vec!["send:m1", "complete"]);
    }

    #[tokio::test]
    async fn test_transient_send_is_retried() {
        crate::logging::init_test_logging();
        let script = Arc::new(Script::default());
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));
        script
            .sends
            .lock()
            .unwrap()
            .push_back(Err(EndpointError::new(ErrorCategory::ServerBusy, "busy")));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.transient_failures, 1);
        assert_eq!(exit.stats.relayed, 1);
        assert_eq!(
            *script.log.lock().unwrap(),
            vec!["send:m1", "send:m1", "complete"]
        );
    }

    #[tokio::test]
    async fn test_permanent_send_dead_letters() {
        crate::logging::init_test_logging();
        let script = Arc::new(Script::default());
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m2"))));
        script.sends.lock().unwrap().push_back(Err(EndpointError::new(
            ErrorCategory::MalformedMessage,
            "bad body",
        )));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.dead_lettered, 1);
        assert_eq!(exit.stats.relayed, 1);
        assert_eq!(
            *script.log.lock().unwrap(),
            vec!["send:m1", "dead_letter:RelayFailed", "send:m2", "complete"]
        );
    }

    #[tokio::test]
    async fn test_permanent_complete_moves_on() {
        let script = Arc::new(Script::default());
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));
        script
            .completes
            .lock()
            .unwrap()
            .push_back(Err(EndpointError::new(ErrorCategory::LockLost, "gone")));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.relayed, 0);
        assert_eq!(exit.stats.permanent_failures, 1);
        assert_eq!(exit.stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_receive_and_delete_needs_no_complete() {
        let script = Arc::new(Script::default());
        let mut received = locked("m1");
        received.lock_token = None;
        script.receives.lock().unwrap().push_back(Ok(Some(received)));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.relayed, 1);
        assert_eq!(*script.log.lock().unwrap(), vec!["send:m1"]);
    }

    #[tokio::test]
    async fn test_permanent_receive_polls_again() {
        let script = Arc::new(Script::default());
        script
            .receives
            .lock()
            .unwrap()
            .push_back(Err(EndpointError::new(ErrorCategory::Unauthorized, "denied")));
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));

        let exit = lane(&script).run().await;

        assert_eq!(exit.stats.permanent_failures, 1);
        assert_eq!(exit.stats.relayed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_immediately() {
        let script = Arc::new(Script::default());
        script.receives.lock().unwrap().push_back(Ok(Some(locked("m1"))));

        let lane = lane(&script);
        lane.shutdown.cancel();
        let exit = lane.run().await;

        assert_eq!(exit.stats.received, 0);
        assert!(script.log.lock().unwrap().is_empty());
    }

    fn slow_source_lane(script: &Arc<Script>) -> PumpLane {
        let settings = LaneSettings {
            source_backoff: BackoffConfig {
                min: Duration::from_millis(100),
                max: Duration::from_secs(10),
            },
            ..fast_settings()
        };
        PumpLane::new(
            0,
            LaneConnection {
                receiver: Box::new(ScriptedReceiver(Arc::clone(script))),
                sender: Box::new(ScriptedSender(Arc::clone(script))),
            },
            settings,
            Arc::new(StaticFaultClassifier::new()),
            CancellationToken::new(),
        )
    }

    fn receive_timeout() -> Result<Option<ReceivedMessage>, EndpointError> {
        Err(EndpointError::new(ErrorCategory::Timeout, "receive timed out"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_resets_source_backoff() {
        let script = Arc::new(Script::default());
        {
            let mut receives = script.receives.lock().unwrap();
            receives.push_back(receive_timeout());
            receives.push_back(Ok(None));
            receives.push_back(receive_timeout());
        }

        let started = tokio::time::Instant::now();
        let exit = slow_source_lane(&script).run().await;

        assert_eq!(exit.stats.transient_failures, 2);
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(200) && waited < Duration::from_millis(300),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_message_resets_source_backoff() {
        let script = Arc::new(Script::default());
        {
            let mut receives = script.receives.lock().unwrap();
            receives.push_back(receive_timeout());
            receives.push_back(Ok(Some(locked("m1"))));
            receives.push_back(receive_timeout());
        }

        let started = tokio::time::Instant::now();
        let exit = slow_source_lane(&script).run().await;

        assert_eq!(exit.stats.relayed, 1);
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(200) && waited < Duration::from_millis(300),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_and_delete_resets_source_backoff() {
        let script = Arc::new(Script::default());
        let mut received = locked("m1");
        received.lock_token = None;
        {
            let mut receives = script.receives.lock().unwrap();
            receives.push_back(receive_timeout());
            receives.push_back(Ok(Some(received)));
            receives.push_back(receive_timeout());
        }

        let started = tokio::time::Instant::now();
        let exit = slow_source_lane(&script).run().await;

        assert_eq!(exit.stats.relayed, 1);
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(200) && waited < Duration::from_millis(300),
            "waited {:?}",
            waited
        );
    }

    #[test]
    fn test_resume_without_context_receives() {
        assert!(matches!(
            LaneState::resume(Stage::Sending, None),
            LaneState::Receiving
        ));
        assert!(matches!(
            LaneState::resume(Stage::Receiving, None),
            LaneState::Receiving
        ));
    }
}
