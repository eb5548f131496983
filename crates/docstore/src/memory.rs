//! In-memory reference implementation of the store contract.
//!
//! Fully conformant `watch` semantics plus fault-injection and
//! write-delay hooks, which makes it the test double for every timing
//! and failure scenario in the workspace.

use crate::{apply_field, deep_merge, DocumentStore, FieldValue, SetMode, StoreError, WatchHub};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// In-process document store.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
    hub: WatchHub,
    queued_faults: Mutex<VecDeque<StoreError>>,
    write_delay: Mutex<Option<Duration>>,
    writes_issued: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next write operation.
    /// Multiple queued faults fail successive writes in order.
    pub fn fail_next_write(&self, err: StoreError) {
        self.queued_faults
            .lock()
            .expect("fault queue poisoned")
            .push_back(err);
    }

    /// Delay every write by `delay` (None disables). Under a paused tokio
    /// clock this holds writes "in flight" until the test advances time.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().expect("delay poisoned") = delay;
    }

    /// Number of write operations (set/update) that reached the store.
    pub fn writes_issued(&self) -> u64 {
        self.writes_issued.load(Ordering::Relaxed)
    }

    /// Snapshot of a document without going through the async contract.
    pub fn peek(&self, path: &str) -> Option<Value> {
        self.docs.lock().expect("docs poisoned").get(path).cloned()
    }

    async fn before_write(&self, path: &str) -> Result<(), StoreError> {
        let delay = *self.write_delay.lock().expect("delay poisoned");
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if let Some(err) = self
            .queued_faults
            .lock()
            .expect("fault queue poisoned")
            .pop_front()
        {
            debug!(path, %err, "injected store fault");
            return Err(err);
        }
        self.writes_issued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.lock().expect("docs poisoned").get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Value, mode: SetMode) -> Result<(), StoreError> {
        self.before_write(path).await?;
        let updated = {
            let mut docs = self.docs.lock().expect("docs poisoned");
            let slot = docs
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match mode {
                SetMode::Merge => deep_merge(slot, &doc),
                SetMode::Replace => *slot = doc,
            }
            slot.clone()
        };
        self.hub.publish(path, Some(updated));
        Ok(())
    }

    async fn update(
        &self,
        path: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), StoreError> {
        self.before_write(path).await?;
        let updated = {
            let mut docs = self.docs.lock().expect("docs poisoned");
            let slot = docs
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            for (field_path, value) in fields {
                apply_field(slot, &field_path, value);
            }
            slot.clone()
        };
        self.hub.publish(path, Some(updated));
        Ok(())
    }

    async fn watch(&self, path: &str) -> watch::Receiver<Option<Value>> {
        let current = self.docs.lock().expect("docs poisoned").get(path).cloned();
        self.hub.subscribe(path, current)
    }
}
