/*!
 * Integration tests for delivery guarantees
 *
 * These tests run the full pump against the in-memory broker, with faults
 * injected around the endpoints, and check what ends up at the destination,
 * in the dead-letter store, and in the broker's operation journal.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_pump::config::{BackoffSettings, PumpConfig};
use relay_pump::endpoint::{DestinationEndpoint, EntityManager, QueueOptions, SourceEndpoint};
use relay_pump::fault_injection::{FaultPlan, FaultySource, FaultyDestination, Operation, Trigger};
use relay_pump::{ErrorCategory, InMemoryBroker, JournalEntry, Message, MessagePump};

const POISON: &str = "poison";

async fn broker_with(source_options: QueueOptions) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_queue("in", source_options).await.unwrap();
    broker
        .create_queue("out", QueueOptions::default())
        .await
        .unwrap();
    broker
}

fn fast_config(parallelism: usize) -> PumpConfig {
    PumpConfig {
        parallelism,
        prefetch_count: 2,
        receive_timeout_ms: 20,
        source_backoff: BackoffSettings { min_ms: 1, max_ms: 8 },
        destination_backoff: BackoffSettings { min_ms: 1, max_ms: 8 },
        ..Default::default()
    }
}

fn seed(broker: &InMemoryBroker, ids: &[&str]) {
    for id in ids {
        let label = if id.starts_with(POISON) { POISON } else { "relay" };
        broker
            .send("in", Message::new(format!("body of {}", id)).with_id(*id).with_label(label))
            .unwrap();
    }
}

/// Poll until `done` holds or the timeout elapses
async fn eventually(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

fn destination_ids(broker: &InMemoryBroker) -> Vec<String> {
    broker
        .peek("out", usize::MAX)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

fn poison_rule() -> FaultPlan {
    FaultPlan::new().fail(
        Operation::Send,
        Trigger::LabelEquals(POISON.to_string()),
        ErrorCategory::MalformedMessage,
    )
}

/// Every message ends up at the destination or in the dead-letter store,
/// even with transient faults on every operation
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_at_least_once_under_random_faults() {
    let broker = broker_with(QueueOptions::default()).await;
    let ids: Vec<String> = (0..200)
        .map(|i| {
            if i % 25 == 0 {
                format!("{}-{}", POISON, i)
            } else {
                format!("m{}", i)
            }
        })
        .collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    seed(&broker, &id_refs);
    broker.clear_journal();

    let source = FaultySource::new(
        Arc::new(broker.source("in")),
        FaultPlan::new()
            .fail(Operation::Receive, Trigger::Probability(0.1), ErrorCategory::Timeout)
            .fail(Operation::Complete, Trigger::Probability(0.1), ErrorCategory::Communication)
            .fail(Operation::DeadLetter, Trigger::Probability(0.1), ErrorCategory::ServerBusy),
    );
    let destination = FaultyDestination::new(
        Arc::new(broker.destination("out")),
        poison_rule().fail(Operation::Send, Trigger::Probability(0.1), ErrorCategory::ServerBusy),
    );

    let pump = MessagePump::start_with_config(Arc::new(source), Arc::new(destination), fast_config(4))
        .await
        .unwrap();

    let settled = eventually(Duration::from_secs(20), || {
        let m = pump.metrics();
        m.completed + m.dead_lettered >= ids.len() as u64
    })
    .await;
    let report = pump.stop().await.unwrap();
    assert!(settled, "relay did not settle: {}", report.summary());

    let delivered: HashSet<String> = destination_ids(&broker).into_iter().collect();
    let dead: HashSet<String> = broker
        .dead_letters("in")
        .unwrap()
        .into_iter()
        .map(|e| e.item_key)
        .collect();

    for id in &ids {
        assert!(
            delivered.contains(id) || dead.contains(id),
            "message {} was lost",
            id
        );
    }
    assert_eq!(dead.len(), 8);
    assert!(dead.iter().all(|id| id.starts_with(POISON)));
    assert_eq!(broker.active_count("in").unwrap(), 0);
}

/// A source message is never completed before its copy was accepted by the destination
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_premature_acknowledgement() {
    let broker = broker_with(QueueOptions::default()).await;
    let ids: Vec<String> = (0..100).map(|i| format!("m{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    seed(&broker, &id_refs);
    broker.clear_journal();

    let destination = FaultyDestination::new(
        Arc::new(broker.destination("out")),
        FaultPlan::new().fail(Operation::Send, Trigger::EveryNth(7), ErrorCategory::Timeout),
    );

    let pump = MessagePump::start_with_config(
        Arc::new(broker.source("in")),
        Arc::new(destination),
        fast_config(4),
    )
    .await
    .unwrap();
    assert!(pump.wait_for_processed(100, Duration::from_secs(10)).await);
    pump.stop().await.unwrap();

    let mut sent_at: HashMap<String, usize> = HashMap::new();
    let mut completed = 0;
    for (position, entry) in broker.journal().into_iter().enumerate() {
        match entry {
            JournalEntry::Sent { queue, message_id } if queue == "out" => {
                sent_at.entry(message_id).or_insert(position);
            }
            JournalEntry::Completed { queue, message_id } if queue == "in" => {
                completed += 1;
                let sent = sent_at
                    .get(&message_id)
                    .unwrap_or_else(|| panic!("{} completed before it was sent", message_id));
                assert!(*sent < position);
            }
            _ => {}
        }
    }
    assert_eq!(completed, 100);
}

/// {A, B, C} with the second send failing transiently
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_second_send_is_retried() {
    let broker = broker_with(QueueOptions::default()).await;
    seed(&broker, &["A", "B", "C"]);

    let destination = FaultyDestination::new(
        Arc::new(broker.destination("out")),
        FaultPlan::new().fail(Operation::Send, Trigger::NthCall(2), ErrorCategory::ServerBusy),
    );
    let injector = destination.injector();

    let pump = MessagePump::start_with_config(
        Arc::new(broker.source("in")),
        Arc::new(destination),
        fast_config(1),
    )
    .await
    .unwrap();
    assert!(pump.wait_for_processed(3, Duration::from_secs(5)).await);
    let report = pump.stop().await.unwrap();

    let mut delivered = destination_ids(&broker);
    delivered.sort();
    assert_eq!(delivered, vec!["A", "B", "C"]);
    assert!(injector.calls(Operation::Send) >= 4);
    assert_eq!(injector.injected(Operation::Send), 1);
    assert_eq!(report.metrics.transient_retries, 1);
    assert!(broker.dead_letters("in").unwrap().is_empty());
}

/// A message that can never be sent is dead-lettered once and the lane carries on
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permanent_send_failure_dead_letters_once() {
    let broker = broker_with(QueueOptions::default()).await;
    seed(&broker, &["poison-1", "good-1", "good-2"]);

    let destination = FaultyDestination::new(Arc::new(broker.destination("out")), poison_rule());

    let pump = MessagePump::start_with_config(
        Arc::new(broker.source("in")),
        Arc::new(destination),
        fast_config(1),
    )
    .await
    .unwrap();
    assert!(pump.wait_for_processed(2, Duration::from_secs(5)).await);
    let report = pump.stop().await.unwrap();

    let dead = broker.dead_letters("in").unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item_key, "poison-1");
    assert_eq!(dead[0].reason, "RelayFailed");
    assert!(dead[0].description.contains("send to destination failed"));

    let mut delivered = destination_ids(&broker);
    delivered.sort();
    assert_eq!(delivered, vec!["good-1", "good-2"]);
    assert_eq!(report.metrics.dead_lettered, 1);
    assert_eq!(report.lanes[0].relayed, 2);
}

/// A dead-letter whose reply was lost is retried and rejected without harm
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_dead_letter_is_harmless() {
    let broker = broker_with(QueueOptions::default()).await;
    seed(&broker, &["poison-1", "good-1"]);

    let source = FaultySource::new(
        Arc::new(broker.source("in")),
        FaultPlan::new().fail_after(Operation::DeadLetter, Trigger::NthCall(1), ErrorCategory::Timeout),
    );
    let source_faults = source.injector();
    let destination = FaultyDestination::new(Arc::new(broker.destination("out")), poison_rule());

    let pump = MessagePump::start_with_config(Arc::new(source), Arc::new(destination), fast_config(1))
        .await
        .unwrap();
    assert!(pump.wait_for_processed(1, Duration::from_secs(5)).await);
    let report = pump.stop().await.unwrap();

    assert_eq!(source_faults.calls(Operation::DeadLetter), 2);
    assert_eq!(broker.dead_letters("in").unwrap().len(), 1);
    assert_eq!(destination_ids(&broker), vec!["good-1"]);
    assert_eq!(report.metrics.transient_retries, 1);
    assert_eq!(report.metrics.permanent_failures, 1);
    assert_eq!(report.lanes[0].relayed, 1);
}

/// A transient complete failure is retried and the message is delivered once
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_complete_is_retried() {
    let broker = broker_with(QueueOptions::default()).await;
    seed(&broker, &["m1"]);

    let source = FaultySource::new(
        Arc::new(broker.source("in")),
        FaultPlan::new().fail(Operation::Complete, Trigger::NthCall(1), ErrorCategory::Unavailable),
    );
    let source_faults = source.injector();

    let pump = MessagePump::start_with_config(
        Arc::new(source),
        Arc::new(broker.destination("out")),
        fast_config(1),
    )
    .await
    .unwrap();
    assert!(pump.wait_for_processed(1, Duration::from_secs(5)).await);
    pump.stop().await.unwrap();

    assert_eq!(source_faults.calls(Operation::Complete), 2);
    assert_eq!(destination_ids(&broker), vec!["m1"]);
    assert_eq!(broker.active_count("in").unwrap(), 0);
}

/// A lost lock means the message is redelivered and relayed again
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_lock_redelivers_duplicate() {
    let broker = broker_with(QueueOptions {
        lock_duration: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    seed(&broker, &["m1"]);

    let source = FaultySource::new(
        Arc::new(broker.source("in")),
        FaultPlan::new().fail(Operation::Complete, Trigger::NthCall(1), ErrorCategory::LockLost),
    );

    let mut config = fast_config(1);
    config.prefetch_count = 0;
    let pump = MessagePump::start_with_config(Arc::new(source), Arc::new(broker.destination("out")), config)
        .await
        .unwrap();
    assert!(pump.wait_for_processed(1, Duration::from_secs(5)).await);
    let report = pump.stop().await.unwrap();

    assert_eq!(destination_ids(&broker), vec!["m1", "m1"]);
    assert_eq!(report.metrics.received, 2);
    assert_eq!(report.metrics.permanent_failures, 1);
    assert_eq!(broker.active_count("in").unwrap(), 0);
}

/// Messages the destination has no room for are parked, not dropped
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversize_message_is_dead_lettered() {
    let broker = InMemoryBroker::new();
    broker.create_queue("in", QueueOptions::default()).await.unwrap();
    broker
        .create_queue(
            "out",
            QueueOptions {
                max_message_size: 16,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    broker
        .send("in", Message::new(vec![0u8; 64]).with_id("big"))
        .unwrap();
    broker.send("in", Message::new("small").with_id("small")).unwrap();

    let source: Arc<dyn SourceEndpoint> = Arc::new(broker.source("in"));
    let destination: Arc<dyn DestinationEndpoint> = Arc::new(broker.destination("out"));
    let pump = MessagePump::start_with_config(source, destination, fast_config(2))
        .await
        .unwrap();
    assert!(pump.wait_for_processed(1, Duration::from_secs(5)).await);
    assert!(
        eventually(Duration::from_secs(5), || pump.metrics().dead_lettered == 1).await
    );
    pump.stop().await.unwrap();

    assert_eq!(destination_ids(&broker), vec!["small"]);
    let dead = broker.dead_letters("in").unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item_key, "big");
}
