//! Backoff: doubling wait interval for one failure domain
//!
//! A [`BackoffTimer`] hands out the delay to wait before re-attempting the
//! same operation after a transient failure. Every call to [`BackoffTimer::get`]
//! doubles the interval up to the configured ceiling; [`BackoffTimer::reset`]
//! drops it back so the next `get` returns the floor again.
//!
//! The interval lives in a single atomic, so one timer may be shared across
//! lanes without a lock.
//!
//! # Example
//!
//! ```
//! use pump_core_resilience::backoff::{BackoffConfig, BackoffTimer};
//! use std::time::Duration;
//!
//! let timer = BackoffTimer::new(BackoffConfig {
//!     min: Duration::from_millis(25),
//!     max: Duration::from_millis(100),
//! });
//!
//! assert_eq!(timer.get(), Duration::from_millis(25));
//! assert_eq!(timer.get(), Duration::from_millis(50));
//! assert_eq!(timer.get(), Duration::from_millis(100));
//! assert_eq!(timer.get(), Duration::from_millis(100)); // capped
//!
//! timer.reset();
//! assert_eq!(timer.get(), Duration::from_millis(25));
//! ```

use crate::error::ResilienceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Floor and ceiling for a backoff timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Interval returned by the first `get` after construction or reset
    pub min: Duration,

    /// Upper bound for any interval
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(25),
            max: Duration::from_millis(60_000),
        }
    }
}

impl BackoffConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.min.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "backoff minimum must be greater than zero".to_string(),
            ));
        }

        if self.min > self.max {
            return Err(ResilienceError::InvalidConfig(format!(
                "backoff minimum {:?} exceeds maximum {:?}",
                self.min, self.max
            )));
        }

        Ok(())
    }

    fn min_ms(&self) -> u64 {
        self.min.as_millis().min(u64::MAX as u128) as u64
    }

    fn max_ms(&self) -> u64 {
        self.max.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Doubling backoff interval, reset on success
#[derive(Debug)]
pub struct BackoffTimer {
    config: BackoffConfig,
    /// Last interval handed out, in milliseconds
    last_ms: AtomicU64,
}

impl BackoffTimer {
    /// Create a timer whose first `get` returns `config.min`
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            last_ms: AtomicU64::new(config.min_ms() / 2),
            config,
        }
    }

    /// Create a timer with the default 25ms..60s range
    pub fn new_default() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Return the next wait interval, doubling the stored one (capped at `max`)
    pub fn get(&self) -> Duration {
        let min = self.config.min_ms();
        let max = self.config.max_ms();

        let mut last = self.last_ms.load(Ordering::Relaxed);
        loop {
            let next = last.saturating_mul(2).max(min).min(max);
            match self
                .last_ms
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Duration::from_millis(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Drop the interval back to half the minimum
    pub fn reset(&self) {
        self.last_ms
            .store(self.config.min_ms() / 2, Ordering::Release);
    }

    /// Last interval handed out, without advancing
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    /// Configuration this timer was built with
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
