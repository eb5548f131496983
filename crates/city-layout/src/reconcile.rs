//! Reconciliation between the live scene, the pending-write buffer, and
//! remote snapshots.
//!
//! Three sources of truth could fight over what the user sees: the
//! scene's in-memory positions (authoritative during and right after a
//! drag), the debounced pending-write buffer, and remote snapshot
//! callbacks. The rule: a building whose local mutation is pending, in
//! flight, or within a post-write grace period is *guarded*, and remote
//! snapshots never reposition a guarded building.

use crate::debounce::KeyedDebouncer;
use crate::fallback::{FallbackStore, PendingDump, PENDING_POSITIONS_KEY};
use crate::store::CityStore;
use docstore::{DocumentStore, StoreError};
use progress_core::{default_slot, snap_to_grid, BuildingId, CityLayout, GridPos, UserId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Trailing delay after the last drop before the coalesced write fires.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(350);
/// Guard hold after a successful write, to outlast the snapshot echo.
pub const SUCCESS_GRACE: Duration = Duration::from_millis(600);
/// Guard hold after a failed write.
pub const FAILURE_GRACE: Duration = Duration::from_secs(2);

/// Buildings laid out per row when computing a first-placement slot.
const SCENE_COLUMNS: usize = 5;

/// Result of an unload-time flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Pending writes drained from the debounce buffer.
    pub attempted: usize,
    /// Writes that reached the store before teardown.
    pub succeeded: usize,
    /// Whether the pending payload landed in the local fallback store.
    pub fallback_written: bool,
}

/// Mediates building positions between the scene, the debounced write
/// path, and remote state.
pub struct Reconciler<S, F> {
    city: CityStore<S>,
    fallback: F,
    scene: CityLayout,
    debouncer: KeyedDebouncer<BuildingId, GridPos>,
    grace_until: HashMap<BuildingId, Instant>,
    last_error: Option<String>,
}

impl<S: DocumentStore, F: FallbackStore> Reconciler<S, F> {
    /// Load the remote layout once and initialize the scene from it.
    pub async fn mount(store: Arc<S>, user: UserId, fallback: F) -> Result<Self, StoreError> {
        let city = CityStore::new(store, user);
        let scene = city.load().await?;
        info!(user = %city.user(), buildings = scene.len(), "city scene mounted");
        Ok(Self {
            city,
            fallback,
            scene,
            debouncer: KeyedDebouncer::new(DEBOUNCE_WINDOW),
            grace_until: HashMap::new(),
            last_error: None,
        })
    }

    /// Positions the scene currently displays.
    pub fn positions(&self) -> &CityLayout {
        &self.scene
    }

    /// Displayed position of one building.
    pub fn position_of(&self, building: &BuildingId) -> Option<GridPos> {
        self.scene.get(building).copied()
    }

    /// Message from the most recent failed smooth save, for the status
    /// indicator. Cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of buildings with a write still waiting in the buffer.
    pub fn pending_count(&self) -> usize {
        self.debouncer.len()
    }

    /// Earliest pending debounce deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    /// Grid slot for a building that has never been placed.
    pub fn suggested_slot(&self) -> GridPos {
        default_slot(self.scene.len(), SCENE_COLUMNS)
    }

    /// Drop handler: snap, reflect immediately in the scene, and
    /// (re)start the building's debounce window. Returns the snapped
    /// position the renderer should display.
    pub fn on_drop(&mut self, building: BuildingId, x: f64, y: f64) -> GridPos {
        let pos = snap_to_grid(x, y);
        self.scene.insert(building.clone(), pos);
        self.debouncer.push(building, pos, Instant::now());
        pos
    }

    /// Click handler from the renderer; resolves the building's displayed
    /// position for whoever routes the click.
    pub fn on_click(&self, building: &BuildingId) -> Option<GridPos> {
        self.position_of(building)
    }

    /// Whether remote snapshots must leave this building alone right now.
    fn is_guarded(&self, building: &BuildingId, now: Instant) -> bool {
        self.debouncer.is_pending(building)
            || self
                .grace_until
                .get(building)
                .is_some_and(|until| *until > now)
    }

    /// Fire every debounced write whose window has elapsed. Returns the
    /// number of writes attempted.
    pub async fn poll(&mut self) -> usize {
        let now = Instant::now();
        let due = self.debouncer.take_due(now);
        let attempted = due.len();
        for (building, pos) in due {
            // Hold the guard across the in-flight write; the deadline is
            // re-set to the proper grace once the outcome is known.
            self.grace_until
                .insert(building.clone(), now + FAILURE_GRACE);
            match self.city.save_one(&building, pos).await {
                Ok(()) => {
                    // The server now has exactly what was sent; the local
                    // map is deliberately not overwritten with its echo.
                    self.grace_until
                        .insert(building, Instant::now() + SUCCESS_GRACE);
                    self.last_error = None;
                }
                Err(err) => {
                    warn!(%building, %err, "smooth save failed; position kept locally");
                    self.grace_until
                        .insert(building, Instant::now() + FAILURE_GRACE);
                    self.last_error = Some(err.user_message().to_string());
                }
            }
        }
        attempted
    }

    /// Wait out every pending debounce window, firing writes as they
    /// come due.
    pub async fn settle(&mut self) {
        while let Some(deadline) = self.debouncer.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            self.poll().await;
        }
    }

    /// Apply a remote snapshot of the user document. Only repositions
    /// buildings already in the scene, and never a guarded one.
    pub fn on_remote_snapshot(&mut self, doc: &Value) {
        let Some(map) = doc.pointer("/cityProgress/buildingPositions") else {
            return;
        };
        let remote: CityLayout = match serde_json::from_value(map.clone()) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(%err, "ignoring malformed remote layout");
                return;
            }
        };
        let now = Instant::now();
        for (building, pos) in remote {
            if self.is_guarded(&building, now) {
                debug!(%building, "remote snapshot suppressed by guard");
                continue;
            }
            if let Some(slot) = self.scene.get_mut(&building) {
                *slot = pos;
            }
        }
    }

    /// Explicit "Save City": batch-write the whole displayed layout.
    pub async fn save_city(&mut self) -> Result<(), StoreError> {
        let layout = self.scene.clone();
        match self.city.save_all(&layout).await {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.last_error = Some(err.user_message().to_string());
                Err(err)
            }
        }
    }

    /// "Reset": persist the empty map, then clear the scene and discard
    /// pending writes. A failed remote write leaves the local view
    /// untouched so the user can retry.
    pub async fn reset_city(&mut self) -> Result<(), StoreError> {
        self.city.reset().await?;
        self.scene.clear();
        self.debouncer.drain_all();
        self.grace_until.clear();
        Ok(())
    }

    /// Best-effort flush when the page hides or unloads: dump everything
    /// still pending to the local fallback store, then attempt the normal
    /// smooth-save writes. The fallback record is removed again only if
    /// every write landed.
    pub async fn flush_now(&mut self) -> FlushReport {
        let pending = self.debouncer.drain_all();
        if pending.is_empty() {
            return FlushReport::default();
        }
        let dump = PendingDump::new(pending.iter().cloned());
        let fallback_written = match serde_json::to_string(&dump) {
            Ok(body) => match self.fallback.put(PENDING_POSITIONS_KEY, &body) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "could not write pending positions to fallback store");
                    false
                }
            },
            Err(err) => {
                warn!(%err, "could not encode pending positions");
                false
            }
        };

        let mut succeeded = 0;
        for (building, pos) in &pending {
            self.grace_until
                .insert(building.clone(), Instant::now() + FAILURE_GRACE);
            match self.city.save_one(building, *pos).await {
                Ok(()) => {
                    succeeded += 1;
                    self.grace_until
                        .insert(building.clone(), Instant::now() + SUCCESS_GRACE);
                }
                Err(err) => {
                    warn!(%building, %err, "unload flush write failed");
                }
            }
        }
        if fallback_written && succeeded == pending.len() {
            if let Err(err) = self.fallback.remove(PENDING_POSITIONS_KEY) {
                warn!(%err, "could not clear fallback record");
            }
        }
        info!(
            attempted = pending.len(),
            succeeded, fallback_written, "unload flush finished"
        );
        FlushReport {
            attempted: pending.len(),
            succeeded,
            fallback_written,
        }
    }
}
