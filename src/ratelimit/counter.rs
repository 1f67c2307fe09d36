//! Rate limit counters and the counter store abstraction.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

use super::descriptor::CounterKey;
use super::rules::Rule;

/// Errors a counter store backend can report.
///
/// These never reach limiter callers; the limiter resolves them through its
/// configured failure mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// A window of this length cannot be represented from the current instant
    #[error("counter window of {0:?} is out of range")]
    WindowOutOfRange(Duration),
}

fn window_end(start: Instant, period: Duration) -> Result<Instant, StoreError> {
    start
        .checked_add(period)
        .ok_or(StoreError::WindowOutOfRange(period))
}

/// State of one counter after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Hits recorded in the current window, including this one
    pub count: u64,
    /// When the current window opened
    pub window_start: Instant,
    /// When the current window closes
    pub window_end: Instant,
}

impl CounterSnapshot {
    /// Time left in the window as seen from `now`.
    pub fn remaining_window(&self, now: Instant) -> Duration {
        self.window_end.saturating_duration_since(now)
    }
}

/// A fixed-window counter.
///
/// The window opens on the first hit and lasts one rule period. Once it has
/// closed, the next hit starts a fresh window at count 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    count: u64,
    window_start: Instant,
    window_end: Instant,
}

impl CounterEntry {
    /// Open a new window at `now` holding one hit.
    pub fn new(now: Instant, period: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            count: 1,
            window_start: now,
            window_end: window_end(now, period)?,
        })
    }

    /// Record one hit, rolling the window over if it has expired.
    pub fn hit(&mut self, now: Instant, period: Duration) -> Result<CounterSnapshot, StoreError> {
        if self.is_expired(now) {
            *self = Self::new(now, period)?;
        } else {
            self.count = self.count.saturating_add(1);
        }
        Ok(self.snapshot())
    }

    /// Whether the window has closed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_end
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Current window start.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Current window end.
    pub fn window_end(&self) -> Instant {
        self.window_end
    }

    /// Copy out the counter state.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }
}

/// Storage for rate limit counters.
///
/// Implementations must make `increment_and_check` atomic per key: concurrent
/// increments of the same key are never lost and never observe a stale value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit for `key` under `rule` and return the resulting state.
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        rule: &Rule,
        now: Instant,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Drop the counter for `key`.
    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Remove every counter whose window closed before `now`.
    ///
    /// Returns how many counters were removed.
    async fn sweep(&self, now: Instant) -> Result<usize, StoreError>;

    /// Number of live counters, if the backend can tell cheaply.
    fn len(&self) -> usize;

    /// Whether the store holds no counters.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process counter store backed by a sharded concurrent map.
///
/// Each key is updated under its shard's write lock, so increments on one key
/// are linearizable while keys in other shards proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, CounterEntry>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a counter, expired or not.
    pub fn get(&self, key: &CounterKey) -> Option<CounterEntry> {
        self.counters.get(key).map(|entry| *entry)
    }

    /// Record one hit. Synchronous core of [`CounterStore::increment_and_check`].
    pub fn hit(
        &self,
        key: &CounterKey,
        period: Duration,
        now: Instant,
    ) -> Result<CounterSnapshot, StoreError> {
        let end = window_end(now, period)?;
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| {
                trace!(key = %key, "Creating new rate limit counter");
                // Starts at zero so the hit below opens the window at one.
                CounterEntry {
                    count: 0,
                    window_start: now,
                    window_end: end,
                }
            });
        entry.hit(now, period)
    }

    /// Remove expired counters. Synchronous core of [`CounterStore::sweep`].
    pub fn remove_expired(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        rule: &Rule,
        now: Instant,
    ) -> Result<CounterSnapshot, StoreError> {
        self.hit(key, rule.period(), now)
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn sweep(&self, now: Instant) -> Result<usize, StoreError> {
        Ok(self.remove_expired(now))
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}
