//! In-process counter store.
//!
//! Suitable for a single instance and for tests. Counters are kept in a
//! sharded map; each increment runs under the entry's shard lock, so two
//! requests racing on the same key never lose an update.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use super::key::CounterKey;
use super::store::{Clock, CounterStore, Increment, StoreError, SystemClock};

/// One fixed window, anchored at its first increment.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: u64,
}

/// A [`CounterStore`] over a `DashMap`.
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every counter whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Number of tracked counters, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counters are tracked.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &CounterKey, window_seconds: u64) -> Result<Increment, StoreError> {
        let now = self.clock.now_secs();

        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert(WindowCounter {
                count: 0,
                expires_at: now.saturating_add(window_seconds),
            });

        if entry.expires_at <= now {
            *entry = WindowCounter {
                count: 0,
                expires_at: now.saturating_add(window_seconds),
            };
        }
        entry.count += 1;

        let result = Increment {
            count: entry.count,
            ttl_seconds: Some(entry.expires_at - now),
        };
        drop(entry);

        trace!(key = %key, count = result.count, "Incremented in-memory counter");
        Ok(result)
    }
}
