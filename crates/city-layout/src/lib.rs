#![deny(warnings)]

//! City building-layout persistence and reconciliation.
//!
//! A user drags building icons around a 2D scene; this crate owns the
//! position data model behind that scene: optimistic local positions,
//! debounced per-building writes to the document store, suppression of
//! stale remote snapshots while a local mutation is in flight, and a
//! best-effort flush (with a local fallback record) when the view goes
//! away.

mod debounce;
mod fallback;
mod reconcile;
mod store;

pub use debounce::KeyedDebouncer;
pub use fallback::{
    FallbackStore, FileFallback, MemoryFallback, PendingDump, PENDING_POSITIONS_KEY,
};
pub use reconcile::{FlushReport, Reconciler, DEBOUNCE_WINDOW, FAILURE_GRACE, SUCCESS_GRACE};
pub use store::CityStore;
