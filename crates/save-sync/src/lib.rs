#![deny(warnings)]

//! Simulation progress synchronization: the phase controller, the save
//! coordinator, and the session glue that wires transitions, manual
//! saves, and the autosave interval to the document store.

mod phase;
mod save;
mod session;

pub use phase::{Award, AwardError, CompletionAward, PhaseController, PhaseError, Transition};
pub use save::{SaveCoordinator, SaveOutcome, SaveTrigger};
pub use session::{run_autosave, Session, AUTOSAVE_INTERVAL};
