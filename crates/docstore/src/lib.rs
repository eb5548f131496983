#![deny(warnings)]

//! Document store contract and implementations.
//!
//! The sync core talks to remote storage through one narrow contract:
//! path-addressed JSON documents with `get`, `set`-with-merge,
//! `update`-with-dotted-field-paths, and a real-time `watch` subscription
//! that delivers the current value immediately and every change after.
//! Two implementations are provided: [`MemoryStore`], the fully
//! conformant in-process reference (and test double), and
//! [`SqliteStore`], a local file-backed store for offline sessions.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{default_sqlite_url, init_db, SqliteStore};

/// Errors produced by store operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transient transport/backend failure; the next natural trigger may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The caller is not allowed to touch this document; retrying without
    /// re-authenticating is futile.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// An `update` was issued against a document that does not exist.
    #[error("document not found: {0}")]
    NotFound(String),
    /// Document body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True when a later retry with the same credentials could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::PermissionDenied(_))
    }

    /// Text suitable for a user-facing toast.
    pub fn user_message(&self) -> &'static str {
        match self {
            StoreError::PermissionDenied(_) => {
                "Could not save: permission denied. Please check that you are signed in."
            }
            _ => "Could not reach the server. Your progress will be saved on the next attempt.",
        }
    }
}

/// Write mode for [`DocumentStore::set`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetMode {
    /// Deep-merge the payload into the existing document (created if absent).
    Merge,
    /// Replace the whole document body.
    Replace,
}

/// Value written by [`DocumentStore::update`] at one dotted field path.
#[derive(Clone, Debug)]
pub enum FieldValue {
    /// Plain value, stored as-is.
    Value(Value),
    /// Resolved to the store's current time as an RFC 3339 string.
    ServerTimestamp,
    /// Elements appended to the existing array, skipping ones already present.
    ArrayUnion(Vec<Value>),
}

/// Path-addressed JSON document storage.
///
/// All operations are asynchronous and may fail with a transient or
/// permanent [`StoreError`]. `watch` returns a receiver holding the
/// current document value; dropping it unsubscribes.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` when it does not exist.
    fn get(&self, path: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Write a document, merging or replacing per `mode`.
    fn set(
        &self,
        path: &str,
        doc: Value,
        mode: SetMode,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Patch individual fields addressed by dotted paths.
    fn update(
        &self,
        path: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to a document. The receiver observes the current value
    /// immediately and every subsequent change until dropped.
    fn watch(&self, path: &str) -> impl Future<Output = watch::Receiver<Option<Value>>> + Send;
}

/// Outcome of [`ensure_document`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ensure {
    /// The document already existed; nothing was written.
    Existed,
    /// The default body was written.
    Created,
}

/// Make sure a document exists before a dependent write, creating it from
/// `default` when absent. Explicit replacement for relying on merge
/// semantics to paper over a missing parent.
pub async fn ensure_document<S: DocumentStore>(
    store: &S,
    path: &str,
    default: Value,
) -> Result<Ensure, StoreError> {
    if store.get(path).await?.is_some() {
        return Ok(Ensure::Existed);
    }
    store.set(path, default, SetMode::Merge).await?;
    Ok(Ensure::Created)
}

/// Deep-merge `patch` into `base`. Objects merge key-by-key; every other
/// value kind replaces wholesale.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            for (k, v) in p {
                match b.get_mut(k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

/// Apply one dotted-path field write to a document body, creating
/// intermediate objects as needed.
pub fn apply_field(doc: &mut Value, path: &str, field: FieldValue) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut slot = doc;
    for part in parents {
        let obj = match slot.as_object_mut() {
            Some(obj) => obj,
            None => return,
        };
        let next = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        slot = next;
    }
    let obj = match slot.as_object_mut() {
        Some(obj) => obj,
        None => return,
    };
    let resolved = match field {
        FieldValue::Value(v) => v,
        FieldValue::ServerTimestamp => Value::String(Utc::now().to_rfc3339()),
        FieldValue::ArrayUnion(items) => {
            let mut arr = obj
                .get(*last)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                if !arr.contains(&item) {
                    arr.push(item);
                }
            }
            Value::Array(arr)
        }
    };
    obj.insert((*last).to_string(), resolved);
}

/// Shared watch-channel registry keyed by document path.
///
/// Both store implementations publish every local write through a hub so
/// `watch` receivers see changes in real time.
#[derive(Default)]
pub(crate) struct WatchHub {
    senders: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
}

impl WatchHub {
    /// Subscribe to `path`, seeding the channel with `current` when it is new.
    pub(crate) fn subscribe(
        &self,
        path: &str,
        current: Option<Value>,
    ) -> watch::Receiver<Option<Value>> {
        let mut senders = self.senders.lock().expect("watch hub poisoned");
        senders
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// Publish a new document value to any subscribers of `path`.
    pub(crate) fn publish(&self, path: &str, value: Option<Value>) {
        let senders = self.senders.lock().expect("watch hub poisoned");
        if let Some(tx) = senders.get(path) {
            tx.send_replace(value);
        }
    }
}
