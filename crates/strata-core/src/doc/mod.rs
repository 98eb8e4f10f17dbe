//! File representation layer: task documents and their directory.

pub mod format;
pub mod fs;

pub use format::{DocError, description_round_trips, parse, render};
pub use fs::{DocStore, LoadError, LoadedDoc, Scan, content_hash};
