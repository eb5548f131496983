#![deny(warnings)]

//! Core domain models and invariants for Career City.
//!
//! This crate defines the serializable types shared by the sync core:
//! phase tracks (the ordered phase list of one simulation, with its fixed
//! step and percentage tables), the per-user `SimulationProgress`
//! document, and the grid position model for the city view. Validation
//! helpers guarantee the basic invariants the rest of the workspace
//! relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a user account, e.g. the auth provider's uid.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Unique identifier for a simulation, e.g. "finance-simulation".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimulationId(pub String);

/// Unique identifier for a city building, e.g. "bank".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildingId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for BuildingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// A track needs at least an initial and a terminal phase.
    #[error("phase track must contain at least two phases")]
    TrackTooShort,
    /// Duplicate phase name within one track.
    #[error("duplicate phase in track: {0}")]
    DuplicatePhase(String),
    /// Percentages must be non-decreasing and end at 100.
    #[error("phase percentages must be non-decreasing and end at 100")]
    BadPercentTable,
    /// Phase name not present in the governing track.
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
    /// `current_step` disagrees with the track's phase->step table.
    #[error("current_step {found} does not match table value {expected}")]
    StepMismatch {
        /// Step the track table derives from `current_phase`.
        expected: u32,
        /// Step actually stored on the document.
        found: u32,
    },
    /// `completed` / `completed_at` must both be set iff the phase is terminal.
    #[error("completion flags are inconsistent with current_phase")]
    CompletionInconsistent,
    /// Answer-map key does not follow the `<phase>Answers` convention.
    #[error("malformed phase answers key: {0}")]
    BadAnswersKey(String),
    /// Document body was not the expected shape.
    #[error("malformed progress document: {0}")]
    MalformedDocument(String),
}

/// One named phase within a track, with its fixed progress percentage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase name, e.g. "exploration".
    pub name: String,
    /// Coarse completion percentage shown while this phase is current.
    pub percent: u8,
}

/// The ordered phase list of one simulation.
///
/// Always begins at `intro` and ends at the single terminal phase
/// `complete`. Step numbers and percentages are pure functions of the
/// phase name; nothing in the rest of the system is allowed to edit them
/// independently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseTrack {
    phases: Vec<PhaseSpec>,
}

/// Name of the initial phase of every track.
pub const INTRO_PHASE: &str = "intro";
/// Name of the terminal phase of every track.
pub const COMPLETE_PHASE: &str = "complete";

impl PhaseTrack {
    /// Build a track from `(name, percent)` pairs, validating the shape.
    pub fn new<I, S>(phases: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (S, u8)>,
        S: Into<String>,
    {
        let phases: Vec<PhaseSpec> = phases
            .into_iter()
            .map(|(name, percent)| PhaseSpec {
                name: name.into(),
                percent,
            })
            .collect();
        if phases.len() < 2 {
            return Err(ValidationError::TrackTooShort);
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &phases {
            if !seen.insert(p.name.clone()) {
                return Err(ValidationError::DuplicatePhase(p.name.clone()));
            }
        }
        let mut last = 0u8;
        for p in &phases {
            if p.percent < last {
                return Err(ValidationError::BadPercentTable);
            }
            last = p.percent;
        }
        if phases.last().map(|p| p.percent) != Some(100) {
            return Err(ValidationError::BadPercentTable);
        }
        Ok(Self { phases })
    }

    /// The standard eight-phase career simulation track.
    pub fn standard() -> Self {
        Self::new([
            (INTRO_PHASE, 0),
            ("pre-reflection", 5),
            ("framework", 15),
            ("exploration", 35),
            ("experience", 60),
            ("post-reflection", 80),
            ("envision", 95),
            (COMPLETE_PHASE, 100),
        ])
        .expect("standard track is well-formed")
    }

    /// The shorter congressional simulation track (supports the explicit
    /// "previous phase" affordance in its phase UIs).
    pub fn congressional() -> Self {
        Self::new([
            (INTRO_PHASE, 0),
            ("briefing", 10),
            ("debate", 40),
            ("vote", 70),
            ("reflection", 90),
            (COMPLETE_PHASE, 100),
        ])
        .expect("congressional track is well-formed")
    }

    /// Ordered phase names.
    pub fn phases(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    /// Zero-based position of `phase` in the track.
    pub fn index_of(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == phase)
    }

    /// One-based step number for `phase`; `current_step` is defined as
    /// exactly this value.
    pub fn step_for(&self, phase: &str) -> Option<u32> {
        self.index_of(phase).map(|i| i as u32 + 1)
    }

    /// Total number of steps (phases) in the track.
    pub fn total_steps(&self) -> u32 {
        self.phases.len() as u32
    }

    /// Fixed progress percentage for `phase`.
    pub fn percent_for(&self, phase: &str) -> Option<u8> {
        self.phases
            .iter()
            .find(|p| p.name == phase)
            .map(|p| p.percent)
    }

    /// The phase immediately after `phase`, if any.
    pub fn next_after(&self, phase: &str) -> Option<&str> {
        let i = self.index_of(phase)?;
        self.phases.get(i + 1).map(|p| p.name.as_str())
    }

    /// The phase immediately before `phase`, if any.
    pub fn previous_before(&self, phase: &str) -> Option<&str> {
        let i = self.index_of(phase)?;
        i.checked_sub(1)
            .and_then(|j| self.phases.get(j))
            .map(|p| p.name.as_str())
    }

    /// First (initial) phase name.
    pub fn first(&self) -> &str {
        &self.phases[0].name
    }

    /// Terminal phase name.
    pub fn terminal(&self) -> &str {
        &self.phases[self.phases.len() - 1].name
    }

    /// Whether `phase` is the terminal phase.
    pub fn is_terminal(&self, phase: &str) -> bool {
        phase == self.terminal()
    }
}

/// Key under which a phase's accumulated answers live in `phase_progress`.
pub fn answers_key(phase: &str) -> String {
    format!("{phase}Answers")
}

/// The persisted record of one user's state within one simulation.
///
/// Exactly one document exists per (user, simulation) pair; it is created
/// lazily by the first merge-write and never deleted by this subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationProgress {
    /// Owning user.
    pub user_id: UserId,
    /// Simulation this record tracks.
    pub simulation_id: SimulationId,
    /// Name of the phase the user is currently in.
    pub current_phase: String,
    /// One-based step derived from `current_phase` via the track table.
    pub current_step: u32,
    /// Number of phases in the governing track.
    pub total_steps: u32,
    /// `"<phase>Answers"` -> accumulated answer payload. Append-only:
    /// moving on never deletes an earlier phase's recorded answers.
    #[serde(default)]
    pub phase_progress: BTreeMap<String, Value>,
    /// Set once, on the first transition out of `intro`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, when `current_phase` becomes the terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Refreshed on every write.
    pub last_updated: DateTime<Utc>,
    /// True only once the terminal phase is reached.
    pub completed: bool,
}

impl SimulationProgress {
    /// Fresh record positioned at the track's initial phase.
    pub fn new(user_id: UserId, simulation_id: SimulationId, track: &PhaseTrack) -> Self {
        Self {
            user_id,
            simulation_id,
            current_phase: track.first().to_string(),
            current_step: 1,
            total_steps: track.total_steps(),
            phase_progress: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            last_updated: Utc::now(),
            completed: false,
        }
    }

    /// Store path of this record: `simulationProgress/{user}_{simulation}`.
    pub fn doc_path(&self) -> String {
        progress_doc_path(&self.user_id, &self.simulation_id)
    }

    /// Serialize to the JSON document shape the store persists.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).expect("progress serializes to JSON")
    }

    /// Reconstruct from a stored document.
    pub fn from_document(doc: &Value) -> Result<Self, ValidationError> {
        serde_json::from_value(doc.clone())
            .map_err(|e| ValidationError::MalformedDocument(e.to_string()))
    }
}

/// Store path of the progress document for a (user, simulation) pair.
pub fn progress_doc_path(user: &UserId, simulation: &SimulationId) -> String {
    format!("simulationProgress/{}_{}", user.0, simulation.0)
}

/// Store path of a user's root document.
pub fn user_doc_path(user: &UserId) -> String {
    format!("users/{}", user.0)
}

/// Validate a progress record against its governing track.
pub fn validate_progress(
    progress: &SimulationProgress,
    track: &PhaseTrack,
) -> Result<(), ValidationError> {
    let expected = track
        .step_for(&progress.current_phase)
        .ok_or_else(|| ValidationError::UnknownPhase(progress.current_phase.clone()))?;
    if progress.current_step != expected {
        return Err(ValidationError::StepMismatch {
            expected,
            found: progress.current_step,
        });
    }
    let terminal = track.is_terminal(&progress.current_phase);
    if progress.completed != terminal || progress.completed_at.is_some() != terminal {
        return Err(ValidationError::CompletionInconsistent);
    }
    for key in progress.phase_progress.keys() {
        let phase = key
            .strip_suffix("Answers")
            .ok_or_else(|| ValidationError::BadAnswersKey(key.clone()))?;
        if track.index_of(phase).is_none() {
            return Err(ValidationError::UnknownPhase(phase.to_string()));
        }
    }
    Ok(())
}

/// Side length of one grid cell in scene pixels.
pub const GRID_CELL_PX: i32 = 80;

/// Grid-snapped position of one building in the city scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPos {
    /// Horizontal pixel coordinate, multiple of [`GRID_CELL_PX`].
    pub x: i32,
    /// Vertical pixel coordinate, multiple of [`GRID_CELL_PX`].
    pub y: i32,
}

/// Per-user city layout: building id -> grid position.
pub type CityLayout = BTreeMap<BuildingId, GridPos>;

/// Snap free pixel coordinates to the nearest grid cell corner.
pub fn snap_to_grid(x: f64, y: f64) -> GridPos {
    let cell = GRID_CELL_PX as f64;
    GridPos {
        x: ((x / cell).round() as i32) * GRID_CELL_PX,
        y: ((y / cell).round() as i32) * GRID_CELL_PX,
    }
}

/// Deterministic starting slot for the `index`-th building that has never
/// been placed before, laid out left-to-right in rows of `columns`.
pub fn default_slot(index: usize, columns: usize) -> GridPos {
    let columns = columns.max(1);
    GridPos {
        x: ((index % columns) as i32) * GRID_CELL_PX,
        y: ((index / columns) as i32) * GRID_CELL_PX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn standard_track_tables() {
        let t = PhaseTrack::standard();
        assert_eq!(t.first(), INTRO_PHASE);
        assert_eq!(t.terminal(), COMPLETE_PHASE);
        assert_eq!(t.total_steps(), 8);
        assert_eq!(t.step_for("exploration"), Some(4));
        assert_eq!(t.percent_for("experience"), Some(60));
        assert_eq!(t.next_after("envision"), Some(COMPLETE_PHASE));
        assert_eq!(t.previous_before(INTRO_PHASE), None);
        assert!(t.is_terminal(COMPLETE_PHASE));
    }

    #[test]
    fn track_rejects_bad_shapes() {
        assert_eq!(
            PhaseTrack::new([("intro", 0)]).unwrap_err(),
            ValidationError::TrackTooShort
        );
        assert_eq!(
            PhaseTrack::new([("intro", 0), ("intro", 100)]).unwrap_err(),
            ValidationError::DuplicatePhase("intro".to_string())
        );
        assert_eq!(
            PhaseTrack::new([("intro", 50), ("mid", 20), ("complete", 100)]).unwrap_err(),
            ValidationError::BadPercentTable
        );
        assert_eq!(
            PhaseTrack::new([("intro", 0), ("complete", 90)]).unwrap_err(),
            ValidationError::BadPercentTable
        );
    }

    #[test]
    fn progress_document_roundtrip() {
        let track = PhaseTrack::standard();
        let mut p = SimulationProgress::new(
            UserId("u1".to_string()),
            SimulationId("finance-simulation".to_string()),
            &track,
        );
        p.current_phase = "framework".to_string();
        p.current_step = track.step_for("framework").unwrap();
        p.started_at = Some(Utc::now());
        p.phase_progress.insert(
            answers_key("intro"),
            serde_json::json!({"ready": true}),
        );
        validate_progress(&p, &track).unwrap();

        let doc = p.to_document();
        assert_eq!(doc["currentPhase"], "framework");
        assert!(doc["phaseProgress"]["introAnswers"]["ready"].as_bool().unwrap());
        let back = SimulationProgress::from_document(&doc).unwrap();
        assert_eq!(back.current_phase, p.current_phase);
        assert_eq!(back.phase_progress, p.phase_progress);
        assert_eq!(back.doc_path(), "simulationProgress/u1_finance-simulation");
    }

    #[test]
    fn validate_catches_step_mismatch() {
        let track = PhaseTrack::standard();
        let mut p = SimulationProgress::new(
            UserId("u1".to_string()),
            SimulationId("s".to_string()),
            &track,
        );
        p.current_step = 3;
        assert_eq!(
            validate_progress(&p, &track).unwrap_err(),
            ValidationError::StepMismatch {
                expected: 1,
                found: 3
            }
        );
    }

    #[test]
    fn validate_catches_completion_drift() {
        let track = PhaseTrack::standard();
        let mut p = SimulationProgress::new(
            UserId("u1".to_string()),
            SimulationId("s".to_string()),
            &track,
        );
        p.completed = true;
        assert_eq!(
            validate_progress(&p, &track).unwrap_err(),
            ValidationError::CompletionInconsistent
        );
    }

    #[test]
    fn snapping_and_default_slots() {
        assert_eq!(snap_to_grid(163.0, 238.0), GridPos { x: 160, y: 240 });
        assert_eq!(snap_to_grid(39.9, 40.0), GridPos { x: 0, y: 80 });
        assert_eq!(default_slot(0, 5), GridPos { x: 0, y: 0 });
        assert_eq!(default_slot(6, 5), GridPos { x: 80, y: 80 });
    }

    proptest! {
        #[test]
        fn step_is_pure_function_of_phase(idx in 0usize..8) {
            let t = PhaseTrack::standard();
            let phase = t.phases().nth(idx).unwrap().to_string();
            prop_assert_eq!(t.step_for(&phase), Some(idx as u32 + 1));
            prop_assert!(t.percent_for(&phase).is_some());
        }

        #[test]
        fn snap_lands_on_grid(x in -5_000.0f64..5_000.0, y in -5_000.0f64..5_000.0) {
            let p = snap_to_grid(x, y);
            prop_assert_eq!(p.x % GRID_CELL_PX, 0);
            prop_assert_eq!(p.y % GRID_CELL_PX, 0);
            prop_assert!((p.x as f64 - x).abs() <= GRID_CELL_PX as f64 / 2.0 + 1.0);
        }
    }
}
