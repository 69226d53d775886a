//! Counter store abstraction.
//!
//! The rate limiter holds no counter state of its own. Every count lives in a
//! [`CounterStore`], which must increment atomically and expire counters on
//! its own once their window has passed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use super::key::CounterKey;

/// Errors a counter store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of one atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Counter value after the increment
    pub count: u64,
    /// Seconds until the counter expires, if the store knows
    pub ttl_seconds: Option<u64>,
}

/// Trait for counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new value.
    ///
    /// A missing or expired counter starts again at 1 and expires
    /// `window_seconds` later.
    async fn increment(&self, key: &CounterKey, window_seconds: u64) -> Result<Increment, StoreError>;
}

/// Source of wall-clock seconds for stores that track expiry themselves.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `now` seconds.
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_secs(), 1_000);
        clock.advance(Duration::from_secs(300));
        assert_eq!(clock.now_secs(), 1_300);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }
}
