//! Generic trailing debounce, one timer per key.
//!
//! A burst of pushes for one key collapses into a single entry carrying
//! the latest payload, due one window after the last push. Deadlines are
//! explicit (`tokio::time::Instant`) rather than hidden in spawned
//! timers, which keeps the coalescing behavior directly testable and
//! leaves nothing to cancel on teardown.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

struct PendingWrite<V> {
    payload: V,
    deadline: Instant,
}

/// Trailing per-key debouncer.
pub struct KeyedDebouncer<K, V> {
    window: Duration,
    pending: HashMap<K, PendingWrite<V>>,
}

impl<K: Eq + Hash + Clone, V> KeyedDebouncer<K, V> {
    /// Debouncer with the given trailing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record the latest payload for `key` and restart its window.
    pub fn push(&mut self, key: K, payload: V, now: Instant) {
        self.pending.insert(
            key,
            PendingWrite {
                payload,
                deadline: now + self.window,
            },
        );
    }

    /// Whether a write for `key` is still waiting for its window.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every entry whose window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .filter_map(|k| self.pending.remove_entry(&k))
            .map(|(k, p)| (k, p.payload))
            .collect()
    }

    /// Remove and return everything, due or not (unload flush).
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        self.pending
            .drain()
            .map(|(k, p)| (k, p.payload))
            .collect()
    }

    /// Number of keys with a pending write.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
