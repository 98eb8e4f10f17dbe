//! strata-core library.
//!
//! A four-level task hierarchy (master → epic → task → subtask) kept as one
//! Markdown document per task, mirrored into a disposable SQLite index.
//!
//! # Conventions
//!
//! - **Errors**: the public API returns [`error::StoreError`]; the index
//!   layer uses `anyhow::Result` with context, surfaced as `StoreError::Index`.
//! - **Logging**: `tracing` macros with structured fields.
//! - **Writes**: one writer thread per project; see [`store::Store`].

pub mod config;
pub mod db;
pub mod doc;
pub mod error;
pub mod lock;
pub mod model;
pub mod path;
pub mod recovery;
pub mod rollup;
pub mod store;
pub mod sync;
pub mod watch;

pub use config::StoreConfig;
pub use db::query::{SubtreeCounts, TaskFilter};
pub use db::rebuild::RebuildReport;
pub use error::{ErrorCode, Result, StoreError};
pub use model::{ChecklistItem, Level, NewTask, Priority, Status, Task, TaskChanges};
pub use recovery::RecoveryReport;
pub use store::{Store, TreeNode, TreeRoot, Workspace};
pub use sync::{Moved, ReconcileReport};
pub use watch::WatchHandle;
