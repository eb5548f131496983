//! Session glue: one user working through one simulation.
//!
//! Owns the phase controller and the save coordinator, fires the
//! transition-triggered save after every committed transition, and runs
//! the autosave interval.

use crate::{
    Award, PhaseController, PhaseError, SaveCoordinator, SaveOutcome, SaveTrigger, Transition,
};
use docstore::DocumentStore;
use progress_core::SimulationProgress;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fixed autosave period.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

/// One user's live simulation session.
pub struct Session<S, A> {
    controller: Arc<Mutex<PhaseController>>,
    coordinator: Arc<SaveCoordinator<S>>,
    award: A,
}

impl<S, A> Session<S, A>
where
    S: DocumentStore + 'static,
    A: Award,
{
    /// Wire a controller to a store.
    pub fn new(controller: PhaseController, store: Arc<S>, award: A) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            coordinator: Arc::new(SaveCoordinator::new(store)),
            award,
        }
    }

    /// The underlying coordinator, for status display.
    pub fn coordinator(&self) -> &Arc<SaveCoordinator<S>> {
        &self.coordinator
    }

    /// Owned copy of the current progress record.
    pub async fn snapshot(&self) -> SimulationProgress {
        self.controller.lock().await.snapshot()
    }

    /// Fixed-table progress percentage for the current phase.
    pub async fn progress_percentage(&self) -> u8 {
        self.controller.lock().await.progress_percentage()
    }

    /// Complete the current phase and fire the transition-triggered save.
    ///
    /// The transition error aborts everything (nothing to save); a save
    /// failure does not undo the transition, the next trigger retries.
    pub async fn complete_phase(
        &self,
        phase_data: Value,
        next_phase: &str,
    ) -> Result<(Transition, SaveOutcome), PhaseError> {
        let (transition, snapshot, track) = {
            let mut c = self.controller.lock().await;
            let t = c.complete_phase(phase_data, next_phase, &self.award).await?;
            (t, c.snapshot(), c.track().clone())
        };
        let outcome = self
            .coordinator
            .request_save(SaveTrigger::Transition, &snapshot, &track)
            .await;
        Ok((transition, outcome))
    }

    /// Re-enter the prior phase (no save; nothing changed worth persisting
    /// beyond the phase pointer, which the next save will carry).
    pub async fn previous_phase(&self) -> Result<Transition, PhaseError> {
        self.controller.lock().await.previous_phase()
    }

    /// Explicit "Save" button.
    pub async fn manual_save(&self) -> SaveOutcome {
        let (snapshot, track) = {
            let c = self.controller.lock().await;
            (c.snapshot(), c.track().clone())
        };
        self.coordinator
            .request_save(SaveTrigger::Manual, &snapshot, &track)
            .await
    }

    /// Best-effort save when the user navigates away.
    pub async fn save_on_leave(&self) -> SaveOutcome {
        let (snapshot, track) = {
            let c = self.controller.lock().await;
            (c.snapshot(), c.track().clone())
        };
        self.coordinator.save_on_leave(&snapshot, &track).await
    }

    /// Spawn the autosave loop; abort the handle on unmount.
    pub fn spawn_autosave(&self, period: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(run_autosave(coordinator, controller, period))
    }
}

/// Autosave loop: every `period`, snapshot the controller and request an
/// automatic save. Runs until the task is aborted.
pub async fn run_autosave<S: DocumentStore>(
    coordinator: Arc<SaveCoordinator<S>>,
    controller: Arc<Mutex<PhaseController>>,
    period: Duration,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        ticker.tick().await;
        let (snapshot, track) = {
            let c = controller.lock().await;
            (c.snapshot(), c.track().clone())
        };
        let outcome = coordinator
            .request_save(SaveTrigger::Auto, &snapshot, &track)
            .await;
        debug!(?outcome, "autosave tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AwardError, CompletionAward};
    use docstore::MemoryStore;
    use progress_core::{PhaseTrack, SimulationId, UserId};
    use serde_json::json;

    struct NoopAward;

    impl Award for NoopAward {
        async fn award(
            &self,
            _user: &UserId,
            _simulation: &SimulationId,
            _points: u32,
            _unlock_tokens: &[String],
        ) -> Result<(), AwardError> {
            Ok(())
        }
    }

    fn session(store: Arc<MemoryStore>) -> Session<MemoryStore, NoopAward> {
        let controller = PhaseController::new(
            UserId("u1".into()),
            SimulationId("finance-simulation".into()),
            PhaseTrack::standard(),
            CompletionAward {
                points: 100,
                unlock_tokens: vec!["bank".into()],
            },
        );
        Session::new(controller, store, NoopAward)
    }

    #[tokio::test]
    async fn transition_triggers_a_save() {
        let store = Arc::new(MemoryStore::new());
        let s = session(store.clone());
        let (transition, outcome) = s
            .complete_phase(json!({"ready": true}), "pre-reflection")
            .await
            .unwrap();
        assert_eq!(transition.to, "pre-reflection");
        assert_eq!(outcome, SaveOutcome::Saved { percent: 5 });
        let doc = store
            .peek("simulationProgress/u1_finance-simulation")
            .unwrap();
        assert_eq!(doc["currentPhase"], "pre-reflection");
        assert_eq!(doc["phaseProgress"]["introAnswers"]["ready"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_ticks_save_current_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let s = session(store.clone());
        s.complete_phase(json!({}), "pre-reflection").await.unwrap();
        let baseline = store.writes_issued();

        let handle = s.spawn_autosave(AUTOSAVE_INTERVAL);
        tokio::time::sleep(Duration::from_secs(95)).await;
        handle.abort();

        // Three ticks elapsed; each issued one merge write of the progress doc.
        assert_eq!(store.writes_issued() - baseline, 3);
        assert!(s.coordinator().last_saved_at().is_some());
    }

    #[tokio::test]
    async fn manual_save_reports_percentage() {
        let store = Arc::new(MemoryStore::new());
        let s = session(store.clone());
        s.complete_phase(json!({}), "pre-reflection").await.unwrap();
        s.complete_phase(json!({}), "framework").await.unwrap();
        assert_eq!(s.manual_save().await, SaveOutcome::Saved { percent: 15 });
    }
}
