//! Synchronization engine: the coordinator between task documents and the
//! index.
//!
//! - `engine`: plan/commit pipeline, roll-up propagation, rebuild
//! - `mutate`: create, move, update and delete
//! - `reconcile`: folding external edits back into the index
//! - `queue`: the single writer thread that serializes all of the above

pub mod engine;
mod mutate;
pub(crate) mod overlay;
pub(crate) mod queue;
pub mod reconcile;
pub(crate) mod validate;

pub use engine::{Engine, LOCK_FILE, Moved, TASKS_DIR};
pub use reconcile::ReconcileReport;
