//! Finite-state control over a simulation's ordered phase sequence.
//!
//! The controller owns the "answers so far" accumulator and enforces the
//! transition rules: forward one phase at a time, an explicit previous-
//! phase affordance, and an award-gated terminal transition that commits
//! nothing when the award collaborator fails.

use chrono::Utc;
use progress_core::{
    answers_key, PhaseTrack, SimulationId, SimulationProgress, UserId,
};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors from the external award collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AwardError {
    /// Transient failure; the user may simply retry the transition.
    #[error("award service unavailable: {0}")]
    Unavailable(String),
    /// The award call was rejected; retrying without re-authenticating is futile.
    #[error("award permission denied: {0}")]
    PermissionDenied(String),
}

/// Completion side-effect collaborator: called exactly once per
/// simulation completion, before the terminal transition commits.
pub trait Award: Send + Sync {
    /// Grant points and unlock tokens for a completed simulation.
    fn award(
        &self,
        user: &UserId,
        simulation: &SimulationId,
        points: u32,
        unlock_tokens: &[String],
    ) -> impl Future<Output = Result<(), AwardError>> + Send;
}

/// What the terminal transition grants through the award collaborator.
#[derive(Clone, Debug)]
pub struct CompletionAward {
    /// Points credited on completion.
    pub points: u32,
    /// City buildings (or other unlocks) granted on completion.
    pub unlock_tokens: Vec<String>,
}

/// Errors from phase transitions.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    /// The requested phase is not in the governing track.
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
    /// The requested transition skips ahead or repeats the current phase.
    #[error("cannot transition from {from} to {to}")]
    OutOfOrder {
        /// Phase the controller is currently in.
        from: String,
        /// Phase the caller asked for.
        to: String,
    },
    /// The simulation already reached its terminal phase.
    #[error("simulation is already complete")]
    AlreadyComplete,
    /// There is no phase before the current one.
    #[error("no previous phase before {0}")]
    NoPreviousPhase(String),
    /// The completion award failed; the transition was not applied.
    #[error("completion award failed: {0}")]
    AwardFailed(#[from] AwardError),
}

/// A committed phase transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Phase left behind.
    pub from: String,
    /// Phase entered.
    pub to: String,
    /// True when `to` is the terminal phase.
    pub completed: bool,
}

/// Drives one simulation through its ordered phase sequence.
pub struct PhaseController {
    track: PhaseTrack,
    progress: SimulationProgress,
    completion: CompletionAward,
    started_instant: Option<Instant>,
}

impl PhaseController {
    /// Controller positioned at the track's initial phase.
    pub fn new(
        user: UserId,
        simulation: SimulationId,
        track: PhaseTrack,
        completion: CompletionAward,
    ) -> Self {
        let progress = SimulationProgress::new(user, simulation, &track);
        Self {
            track,
            progress,
            completion,
            started_instant: None,
        }
    }

    /// Resume from a previously saved progress document.
    pub fn resume(
        progress: SimulationProgress,
        track: PhaseTrack,
        completion: CompletionAward,
    ) -> Result<Self, PhaseError> {
        if track.index_of(&progress.current_phase).is_none() {
            return Err(PhaseError::UnknownPhase(progress.current_phase));
        }
        Ok(Self {
            track,
            progress,
            completion,
            started_instant: None,
        })
    }

    /// Current progress record.
    pub fn progress(&self) -> &SimulationProgress {
        &self.progress
    }

    /// Owned copy of the current progress record, for a save snapshot.
    pub fn snapshot(&self) -> SimulationProgress {
        self.progress.clone()
    }

    /// Governing phase track.
    pub fn track(&self) -> &PhaseTrack {
        &self.track
    }

    /// Fixed-table progress percentage for the current phase.
    pub fn progress_percentage(&self) -> u8 {
        self.track
            .percent_for(&self.progress.current_phase)
            .unwrap_or(0)
    }

    /// Time since the first transition out of the initial phase, if the
    /// simulation was started within this process.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_instant.map(|t| t.elapsed())
    }

    /// Record `phase_data` for the current phase and move to `next_phase`.
    ///
    /// `next_phase` must be the immediate successor, or any earlier phase
    /// (the explicit back-step affordance; stored answers are untouched
    /// beyond the current phase's payload, which is overwritten last-
    /// write-wins). Entering the terminal phase awaits the award
    /// collaborator first; on failure nothing is committed and the caller
    /// may retry the same transition.
    pub async fn complete_phase<A: Award>(
        &mut self,
        phase_data: Value,
        next_phase: &str,
        award: &A,
    ) -> Result<Transition, PhaseError> {
        let current = self.progress.current_phase.clone();
        if self.track.is_terminal(&current) {
            return Err(PhaseError::AlreadyComplete);
        }
        let cur_idx = self
            .track
            .index_of(&current)
            .ok_or_else(|| PhaseError::UnknownPhase(current.clone()))?;
        let next_idx = self
            .track
            .index_of(next_phase)
            .ok_or_else(|| PhaseError::UnknownPhase(next_phase.to_string()))?;
        let forward = next_idx == cur_idx + 1;
        let backward = next_idx < cur_idx;
        if !forward && !backward {
            return Err(PhaseError::OutOfOrder {
                from: current,
                to: next_phase.to_string(),
            });
        }

        let entering_terminal = forward && self.track.is_terminal(next_phase);
        if entering_terminal {
            // Gate the commit on the award call: a failure here must leave
            // the controller exactly where it was.
            award
                .award(
                    &self.progress.user_id,
                    &self.progress.simulation_id,
                    self.completion.points,
                    &self.completion.unlock_tokens,
                )
                .await?;
        }

        let now = Utc::now();
        self.progress
            .phase_progress
            .insert(answers_key(&current), phase_data);
        if cur_idx == 0 && forward && self.progress.started_at.is_none() {
            self.progress.started_at = Some(now);
            self.started_instant = Some(Instant::now());
        }
        self.progress.current_phase = next_phase.to_string();
        self.progress.current_step = next_idx as u32 + 1;
        if entering_terminal {
            self.progress.completed_at = Some(now);
            self.progress.completed = true;
            info!(
                user = %self.progress.user_id,
                simulation = %self.progress.simulation_id,
                "simulation completed"
            );
        }
        self.progress.last_updated = now;
        debug!(from = %current, to = %next_phase, "phase transition committed");
        Ok(Transition {
            from: current,
            to: next_phase.to_string(),
            completed: entering_terminal,
        })
    }

    /// Re-enter the prior phase without altering any stored answers.
    pub fn previous_phase(&mut self) -> Result<Transition, PhaseError> {
        let current = self.progress.current_phase.clone();
        if self.progress.completed {
            return Err(PhaseError::AlreadyComplete);
        }
        let prev = self
            .track
            .previous_before(&current)
            .ok_or_else(|| PhaseError::NoPreviousPhase(current.clone()))?
            .to_string();
        let prev_idx = self.track.index_of(&prev).unwrap_or(0);
        self.progress.current_phase = prev.clone();
        self.progress.current_step = prev_idx as u32 + 1;
        self.progress.last_updated = Utc::now();
        Ok(Transition {
            from: current,
            to: prev,
            completed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::{validate_progress, COMPLETE_PHASE};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Test award collaborator: fails a configurable number of times,
    /// then succeeds, counting successful grants.
    #[derive(Default)]
    struct TestAward {
        failures_left: Mutex<u32>,
        granted: AtomicU32,
    }

    impl TestAward {
        fn failing(n: u32) -> Self {
            Self {
                failures_left: Mutex::new(n),
                granted: AtomicU32::new(0),
            }
        }
    }

    impl Award for TestAward {
        async fn award(
            &self,
            _user: &UserId,
            _simulation: &SimulationId,
            _points: u32,
            _unlock_tokens: &[String],
        ) -> Result<(), AwardError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(AwardError::PermissionDenied("not signed in".into()));
            }
            self.granted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn controller() -> PhaseController {
        PhaseController::new(
            UserId("u1".into()),
            SimulationId("finance-simulation".into()),
            PhaseTrack::standard(),
            CompletionAward {
                points: 100,
                unlock_tokens: vec!["bank".into()],
            },
        )
    }

    #[tokio::test]
    async fn first_transition_stamps_started_at() {
        let mut c = controller();
        let award = TestAward::default();
        assert!(c.progress().started_at.is_none());
        let t = c
            .complete_phase(json!({}), "pre-reflection", &award)
            .await
            .unwrap();
        assert_eq!(t.from, "intro");
        assert_eq!(c.progress().current_phase, "pre-reflection");
        assert!(c.progress().started_at.is_some());
        assert_eq!(c.progress().phase_progress["introAnswers"], json!({}));
        validate_progress(c.progress(), c.track()).unwrap();
    }

    #[tokio::test]
    async fn skipping_ahead_is_rejected() {
        let mut c = controller();
        let award = TestAward::default();
        let err = c
            .complete_phase(json!({}), "exploration", &award)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PhaseError::OutOfOrder {
                from: "intro".into(),
                to: "exploration".into()
            }
        );
        assert_eq!(c.progress().current_phase, "intro");
    }

    #[tokio::test]
    async fn answers_accumulate_monotonically() {
        let mut c = controller();
        let award = TestAward::default();
        let phases: Vec<String> = c.track().phases().map(str::to_string).collect();
        for window in phases.windows(2) {
            c.complete_phase(json!({"phase": window[0].clone()}), &window[1], &award)
                .await
                .unwrap();
            // Every previously recorded answer entry is still present.
            for earlier in phases.iter().take_while(|p| p.as_str() != window[1]) {
                assert!(
                    c.progress().phase_progress.contains_key(&answers_key(earlier)),
                    "lost answers for {earlier}"
                );
            }
            assert_eq!(
                c.progress().current_step,
                c.track().step_for(&c.progress().current_phase).unwrap()
            );
        }
        assert!(c.progress().completed);
        assert!(c.progress().completed_at.is_some());
        assert_eq!(award.granted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_award_aborts_terminal_transition() {
        let mut c = controller();
        let award = TestAward::failing(1);
        let phases: Vec<String> = c.track().phases().map(str::to_string).collect();
        // Walk to the phase just before terminal.
        for window in phases.windows(2).take(phases.len() - 2) {
            c.complete_phase(json!({}), &window[1], &award).await.unwrap();
        }
        assert_eq!(c.progress().current_phase, "envision");
        let before = c.snapshot();

        let err = c
            .complete_phase(json!({"vision": "CFO"}), COMPLETE_PHASE, &award)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::AwardFailed(_)));
        assert_eq!(c.progress().current_phase, before.current_phase);
        assert_eq!(c.progress().completed_at, None);
        assert!(!c.progress().completed);
        assert_eq!(c.progress().phase_progress, before.phase_progress);

        // Retrying after the collaborator recovers succeeds.
        let t = c
            .complete_phase(json!({"vision": "CFO"}), COMPLETE_PHASE, &award)
            .await
            .unwrap();
        assert!(t.completed);
        assert!(c.progress().completed_at.is_some());
        assert_eq!(award.granted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn previous_phase_keeps_answers_and_recompletion_overwrites() {
        let mut c = PhaseController::new(
            UserId("u1".into()),
            SimulationId("congress".into()),
            PhaseTrack::congressional(),
            CompletionAward {
                points: 50,
                unlock_tokens: vec![],
            },
        );
        let award = TestAward::default();
        c.complete_phase(json!({}), "briefing", &award).await.unwrap();
        c.complete_phase(json!({"stance": "yea"}), "debate", &award)
            .await
            .unwrap();

        c.previous_phase().unwrap();
        assert_eq!(c.progress().current_phase, "briefing");
        assert_eq!(
            c.progress().phase_progress["briefingAnswers"],
            json!({"stance": "yea"})
        );

        // Re-completing the phase overwrites its payload, last write wins.
        c.complete_phase(json!({"stance": "nay"}), "debate", &award)
            .await
            .unwrap();
        assert_eq!(
            c.progress().phase_progress["briefingAnswers"],
            json!({"stance": "nay"})
        );
        // started_at was stamped on the very first exit from intro only.
        let started = c.progress().started_at;
        c.previous_phase().unwrap();
        c.complete_phase(json!({}), "debate", &award).await.unwrap();
        assert_eq!(c.progress().started_at, started);
    }

    #[tokio::test]
    async fn terminal_controller_rejects_everything() {
        let mut c = controller();
        let award = TestAward::default();
        let phases: Vec<String> = c.track().phases().map(str::to_string).collect();
        for window in phases.windows(2) {
            c.complete_phase(json!({}), &window[1], &award).await.unwrap();
        }
        assert_eq!(
            c.complete_phase(json!({}), "intro", &award).await.unwrap_err(),
            PhaseError::AlreadyComplete
        );
        assert_eq!(c.previous_phase().unwrap_err(), PhaseError::AlreadyComplete);
    }

    #[tokio::test]
    async fn resume_reconstructs_saved_state() {
        let mut c = controller();
        let award = TestAward::default();
        c.complete_phase(json!({"q1": "a"}), "pre-reflection", &award)
            .await
            .unwrap();
        c.complete_phase(json!({"q2": "b"}), "framework", &award)
            .await
            .unwrap();

        let doc = c.snapshot().to_document();
        let restored = SimulationProgress::from_document(&doc).unwrap();
        let resumed = PhaseController::resume(
            restored,
            PhaseTrack::standard(),
            CompletionAward {
                points: 100,
                unlock_tokens: vec![],
            },
        )
        .unwrap();
        assert_eq!(resumed.progress().current_phase, "framework");
        assert_eq!(
            resumed.progress().phase_progress,
            c.progress().phase_progress
        );
        assert_eq!(resumed.progress_percentage(), 15);
    }
}
