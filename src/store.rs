//! Shared counter store interface.
//!
//! All cross-instance coordination — rate-limit counters, used-token markers,
//! refresh-attempt windows — goes through [`CounterStore`]. The trait exposes
//! only atomic primitives so the limiter and the replay detector stay correct
//! when many gateway replicas share one backend (e.g., a distributed cache).
//!
//! [`InMemoryCounterStore`] is the single-instance backend and test double;
//! a distributed deployment supplies its own implementation.

use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counter value observed after an increment, plus the remaining window time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Value of the counter after the increment.
    pub count: u64,
    /// Time until the counter's window expires and the count resets.
    pub resets_in: Duration,
}

/// Atomic key-value primitives required of the shared store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by one. If the key is absent it is created
    /// with value 1 and expiry `window`; an existing key keeps its original
    /// expiry (fixed windows, not sliding).
    async fn incr_with_ttl(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Atomically create `key` with expiry `ttl` if and only if it is absent.
    ///
    /// Returns `Ok(true)` when the key was created (it did not exist), and
    /// `Ok(false)` when the key already existed. This is the primitive the
    /// replay detector relies on; it must never be emulated with a separate
    /// read followed by a write.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically replace the value of `key` if it currently equals
    /// `expected`. Returns `Ok(true)` on success, `Ok(false)` when the value
    /// differed or the key was absent.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: u64,
    expires_at_millis: u64,
}

/// In-memory [`CounterStore`] for single-instance deployments and tests.
///
/// Expired keys are pruned lazily on access.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic window tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned counter map cannot be trusted for admission decisions.
        self.data.lock().expect("counter store mutex poisoned")
    }

    fn live_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: u64,
    ) -> Option<&'a mut Entry> {
        if let Some(entry) = map.get(key) {
            if entry.expires_at_millis <= now {
                map.remove(key);
                return None;
            }
        }
        map.get_mut(key)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_ttl(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live_entry(&mut map, key, now) {
            Some(entry) => {
                entry.value += 1;
                let resets_in = Duration::from_millis(entry.expires_at_millis - now);
                Ok(WindowCount { count: entry.value, resets_in })
            }
            None => {
                let expires_at_millis = now + window.as_millis() as u64;
                map.insert(key.to_string(), Entry { value: 1, expires_at_millis });
                Ok(WindowCount { count: 1, resets_in: window })
            }
        }
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        if Self::live_entry(&mut map, key, now).is_some() {
            return Ok(false);
        }
        let expires_at_millis = now + ttl.as_millis() as u64;
        map.insert(key.to_string(), Entry { value: 1, expires_at_millis });
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock();
        match Self::live_entry(&mut map, key, now) {
            Some(entry) if entry.value == expected => {
                entry.value = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
