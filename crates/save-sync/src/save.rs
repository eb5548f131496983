//! Save coordination: at most one in-flight progress write per record.
//!
//! Any number of triggers may fire concurrently (the 30-second interval,
//! the manual save button, a phase transition); while a write is in
//! flight every further request is dropped, not queued. Nothing is lost
//! by dropping: state keeps accumulating and the next successful save
//! captures the latest snapshot.

use chrono::{DateTime, Utc};
use docstore::{ensure_document, DocumentStore, Ensure, FieldValue, StoreError};
use progress_core::{user_doc_path, PhaseTrack, SimulationProgress, UserId};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What caused a save request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Interval timer tick; silent on success, logged-only on failure.
    Auto,
    /// Explicit user action; the caller surfaces both outcomes.
    Manual,
    /// Phase transition auto-save.
    Transition,
}

/// Result of one save request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The write landed; `percent` feeds the manual-save success toast.
    Saved {
        /// Progress percentage at the time of the snapshot.
        percent: u8,
    },
    /// Another save was in flight; this request was a no-op.
    Dropped,
    /// The write failed.
    Failed {
        /// User-facing message, distinct for permission errors.
        message: String,
        /// Whether a later natural trigger may succeed.
        transient: bool,
    },
}

/// Serializes concurrent save attempts for one progress record.
pub struct SaveCoordinator<S> {
    store: Arc<S>,
    in_flight: AtomicBool,
    last_saved_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

/// Clears the in-flight flag when the save future completes or is
/// dropped mid-write (an aborted autosave task must not wedge every
/// later save).
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: DocumentStore> SaveCoordinator<S> {
    /// Coordinator over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            in_flight: AtomicBool::new(false),
            last_saved_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Timestamp of the most recent successful save.
    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        *self.last_saved_at.lock().expect("last_saved_at poisoned")
    }

    /// Message of the most recent failed save, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error poisoned").clone()
    }

    /// Attempt to persist `snapshot`. Returns [`SaveOutcome::Dropped`]
    /// without touching the store when a save is already in flight.
    pub async fn request_save(
        &self,
        trigger: SaveTrigger,
        snapshot: &SimulationProgress,
        track: &PhaseTrack,
    ) -> SaveOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!(?trigger, "save already in flight, dropping request");
            return SaveOutcome::Dropped;
        }
        let guard = InFlightGuard(&self.in_flight);
        let result = self.write(snapshot).await;
        drop(guard);

        match result {
            Ok(()) => {
                let now = Utc::now();
                *self.last_saved_at.lock().expect("last_saved_at poisoned") = Some(now);
                self.last_error
                    .lock()
                    .expect("last_error poisoned")
                    .take();
                let percent = track.percent_for(&snapshot.current_phase).unwrap_or(0);
                match trigger {
                    SaveTrigger::Manual => {
                        info!(percent, "progress saved (manual)");
                    }
                    _ => debug!(?trigger, percent, "progress saved"),
                }
                SaveOutcome::Saved { percent }
            }
            Err(err) => {
                let message = err.user_message().to_string();
                *self.last_error.lock().expect("last_error poisoned") =
                    Some(err.to_string());
                match trigger {
                    SaveTrigger::Manual => warn!(%err, "manual save failed"),
                    _ => warn!(?trigger, %err, "background save failed, will retry on next trigger"),
                }
                SaveOutcome::Failed {
                    message,
                    transient: err.is_transient(),
                }
            }
        }
    }

    /// Best-effort save before the view is torn down or navigated away.
    /// Same write path; not guaranteed to complete before teardown.
    pub async fn save_on_leave(
        &self,
        snapshot: &SimulationProgress,
        track: &PhaseTrack,
    ) -> SaveOutcome {
        debug!("attempting save on leave");
        self.request_save(SaveTrigger::Auto, snapshot, track).await
    }

    async fn write(&self, snapshot: &SimulationProgress) -> Result<(), StoreError> {
        // The user-level record must exist before the progress document is
        // written; an update against a nonexistent parent is an error.
        ensure_document(
            self.store.as_ref(),
            &user_doc_path(&snapshot.user_id),
            minimal_user_doc(&snapshot.user_id),
        )
        .await?;

        let mut fresh = snapshot.clone();
        fresh.last_updated = Utc::now();
        let path = fresh.doc_path();
        if ensure_document(self.store.as_ref(), &path, fresh.to_document()).await?
            == Ensure::Created
        {
            return Ok(());
        }
        // Field-level patch, not a document merge. Each answers payload is
        // a whole value: after a back-step, re-completing a phase with a
        // smaller payload must not leave the old payload's extra keys on
        // the server. Fields written by other components stay untouched.
        let mut fields: Vec<(String, FieldValue)> = vec![
            (
                "currentPhase".to_string(),
                FieldValue::Value(json!(fresh.current_phase)),
            ),
            (
                "currentStep".to_string(),
                FieldValue::Value(json!(fresh.current_step)),
            ),
            (
                "totalSteps".to_string(),
                FieldValue::Value(json!(fresh.total_steps)),
            ),
            (
                "completed".to_string(),
                FieldValue::Value(json!(fresh.completed)),
            ),
            (
                "lastUpdated".to_string(),
                FieldValue::Value(json!(fresh.last_updated)),
            ),
        ];
        if let Some(t) = fresh.started_at {
            fields.push(("startedAt".to_string(), FieldValue::Value(json!(t))));
        }
        if let Some(t) = fresh.completed_at {
            fields.push(("completedAt".to_string(), FieldValue::Value(json!(t))));
        }
        for (key, payload) in &fresh.phase_progress {
            fields.push((
                format!("phaseProgress.{key}"),
                FieldValue::Value(payload.clone()),
            ));
        }
        self.store.update(&path, fields).await
    }
}

/// Minimal default user document with empty progress containers.
fn minimal_user_doc(user: &UserId) -> serde_json::Value {
    json!({
        "userId": user.0,
        "createdAt": Utc::now().to_rfc3339(),
        "simulationProgress": {},
        "cityProgress": {"buildingPositions": {}},
    })
}
