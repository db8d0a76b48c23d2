/*!
 * Throughput measurement
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Counts relayed messages and records when an optional target is reached
#[derive(Debug)]
pub struct ThroughputMeter {
    started: Instant,
    processed: AtomicU64,
    target: Option<u64>,
    target_reached: OnceLock<Duration>,
}

impl ThroughputMeter {
    pub fn new(target: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            processed: AtomicU64::new(0),
            target,
            target_reached: OnceLock::new(),
        }
    }

    /// Record one relayed message
    pub fn record(&self) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(target) = self.target {
            if processed == target {
                let _ = self.target_reached.set(self.started.elapsed());
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Time taken to reach the target count, once reached
    pub fn target_reached_after(&self) -> Option<Duration> {
        self.target_reached.get().copied()
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let elapsed = self.started.elapsed();
        let processed = self.processed();
        let secs = elapsed.as_secs_f64();

        ThroughputSnapshot {
            processed,
            elapsed_ms: elapsed.as_millis() as u64,
            messages_per_sec: if secs > 0.0 {
                processed as f64 / secs
            } else {
                0.0
            },
            target: self.target,
            target_reached_ms: self.target_reached_after().map(|d| d.as_millis() as u64),
        }
    }
}

/// Point-in-time throughput readout
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    pub processed: u64,
    pub elapsed_ms: u64,
    pub messages_per_sec: f64,
    pub target: Option<u64>,
    pub target_reached_ms: Option<u64>,
}

impl ThroughputSnapshot {
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} messages in {} ({:.1} msg/s)",
            self.processed,
            format_duration(self.elapsed_ms),
            self.messages_per_sec
        );
        match (self.target, self.target_reached_ms) {
            (Some(target), Some(ms)) => {
                line.push_str(&format!(", target {} reached after {}", target, format_duration(ms)))
            }
            (Some(target), None) => line.push_str(&format!(", target {} not reached", target)),
            (None, _) => {}
        }
        line
    }
}

/// Format duration into human-readable format
fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms);
    }

    let seconds = ms / 1000;
    let minutes = seconds / 60;

    if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}.{:03}s", seconds, ms % 1000)
    }
}
