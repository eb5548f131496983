//! Local fallback store for unload-time pending writes.
//!
//! When the view is torn down with debounced writes still pending, the
//! pending payload is written synchronously to a local key-value store so
//! the next session can inspect what may not have reached the server.
//! The record is never replayed automatically.

use chrono::{DateTime, Utc};
use progress_core::{BuildingId, GridPos};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

/// Key under which pending building positions are dumped.
pub const PENDING_POSITIONS_KEY: &str = "pending_positions";

/// Synchronous key-value store usable from an unload handler.
pub trait FallbackStore: Send {
    /// Write `value` under `key`, replacing any previous value.
    fn put(&mut self, key: &str, value: &str) -> io::Result<()>;
    /// Read the value under `key`.
    fn get(&self, key: &str) -> Option<String>;
    /// Remove the value under `key`.
    fn remove(&mut self, key: &str) -> io::Result<()>;
}

/// Pending positions as dumped at unload time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingDump {
    /// When the dump was written.
    pub saved_at: DateTime<Utc>,
    /// Positions that had not yet been flushed to the store.
    pub positions: BTreeMap<BuildingId, GridPos>,
}

impl PendingDump {
    /// Build a dump from drained debouncer entries.
    pub fn new(entries: impl IntoIterator<Item = (BuildingId, GridPos)>) -> Self {
        Self {
            saved_at: Utc::now(),
            positions: entries.into_iter().collect(),
        }
    }

    /// Read back the dump left by a previous session, if any.
    pub fn inspect<F: FallbackStore>(fallback: &F) -> Option<Self> {
        let raw = fallback.get(PENDING_POSITIONS_KEY)?;
        serde_json::from_str(&raw).ok()
    }
}

/// File-backed fallback store: one file per key under a directory.
pub struct FileFallback {
    dir: PathBuf,
}

impl FileFallback {
    /// Fallback store rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl FallbackStore for FileFallback {
    fn put(&mut self, key: &str, value: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.key_path(key), value)
    }

    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.key_path(key)).ok()
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.key_path(key)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// In-memory fallback store, for tests and headless runs.
#[derive(Default)]
pub struct MemoryFallback {
    entries: BTreeMap<String, String>,
}

impl FallbackStore for MemoryFallback {
    fn put(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_roundtrip_through_memory_fallback() {
        let mut fb = MemoryFallback::default();
        let dump = PendingDump::new([(BuildingId("bank".into()), GridPos { x: 160, y: 240 })]);
        fb.put(
            PENDING_POSITIONS_KEY,
            &serde_json::to_string(&dump).unwrap(),
        )
        .unwrap();

        let back = PendingDump::inspect(&fb).unwrap();
        assert_eq!(back.positions, dump.positions);

        fb.remove(PENDING_POSITIONS_KEY).unwrap();
        assert!(PendingDump::inspect(&fb).is_none());
    }

    #[test]
    fn file_fallback_roundtrip() {
        let dir = std::env::temp_dir()
            .join("career-city-tests")
            .join(format!("fallback-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut fb = FileFallback::new(&dir);
        assert!(fb.get(PENDING_POSITIONS_KEY).is_none());
        fb.put(PENDING_POSITIONS_KEY, "{}").unwrap();
        assert_eq!(fb.get(PENDING_POSITIONS_KEY).unwrap(), "{}");
        fb.remove(PENDING_POSITIONS_KEY).unwrap();
        assert!(fb.get(PENDING_POSITIONS_KEY).is_none());
    }
}
