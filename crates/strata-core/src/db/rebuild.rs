//! Full index rebuild from the task documents.
//!
//! The index is disposable: everything in it is re-derived from the files.
//! Documents that cannot be placed in a consistent hierarchy are skipped with
//! a warning and stay on disk untouched.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;

use super::write::{clear_index, record_rebuild, upsert_task};
use crate::doc::LoadedDoc;
use crate::model::{Level, now};
use crate::path::{compute_path, validate_level_transition};
use crate::sync::validate;

/// A document left out of the index, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub file: PathBuf,
    pub reason: String,
}

/// Report returned after a full index rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Document files found on disk.
    pub document_count: usize,
    /// Tasks written to the rebuilt index.
    pub task_count: usize,
    /// Documents left out of the index.
    pub skipped: Vec<SkippedDocument>,
    /// Tasks whose stored `path` disagreed with their position in the tree.
    pub repathed: Vec<String>,
    /// Derived fields corrected after the rebuild.
    pub refreshed: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Documents accepted into the index, in insertion order.
#[derive(Debug, Default)]
pub struct Selection {
    pub accepted: Vec<LoadedDoc>,
    pub skipped: Vec<SkippedDocument>,
    pub repathed: Vec<String>,
}

/// Pick the documents that form a consistent hierarchy for `project`.
///
/// Parents are decided before children (level by level), so a task is
/// accepted only if its whole ancestor chain was. Paths are re-derived from
/// the parent's path and the task's own `path_order`; when two siblings claim
/// the same order, the earlier-created one keeps it.
#[must_use]
pub fn select_consistent(project: &str, mut docs: Vec<LoadedDoc>) -> Selection {
    docs.sort_by(|a, b| {
        a.task
            .level
            .cmp(&b.task.level)
            .then(a.task.path_order.cmp(&b.task.path_order))
            .then(a.task.created_at.cmp(&b.task.created_at))
            .then(a.task.id.cmp(&b.task.id))
    });

    let mut selection = Selection::default();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut accepted: HashMap<String, (String, Level)> = HashMap::new();
    let mut taken: HashSet<(Option<String>, u32)> = HashSet::new();

    for mut doc in docs {
        let skip = |doc: &LoadedDoc, reason: String| {
            tracing::warn!(
                task_id = %doc.task.id,
                path = %doc.file.display(),
                reason = %reason,
                "excluding task document from index"
            );
            SkippedDocument {
                file: doc.file.clone(),
                reason,
            }
        };

        if doc.task.project != project {
            let reason = format!("belongs to project '{}'", doc.task.project);
            selection.skipped.push(skip(&doc, reason));
            continue;
        }
        if !seen_ids.insert(doc.task.id.clone()) {
            selection
                .skipped
                .push(skip(&doc, "duplicate task id".to_string()));
            continue;
        }
        if let Err(err) = validate::document(&doc.task) {
            selection.skipped.push(skip(&doc, err.to_string()));
            continue;
        }

        let parent = match doc.task.parent_id.as_deref() {
            None => None,
            Some(parent_id) => match accepted.get(parent_id) {
                Some(entry) => Some(entry.clone()),
                None => {
                    let reason = format!("parent '{parent_id}' is missing or excluded");
                    selection.skipped.push(skip(&doc, reason));
                    continue;
                }
            },
        };
        let (parent_path, parent_level) = match parent {
            Some((path, level)) => (Some(path), Some(level)),
            None => (None, None),
        };

        if let Err(err) = validate_level_transition(doc.task.level, parent_level) {
            selection.skipped.push(skip(&doc, err.to_string()));
            continue;
        }

        let slot = (doc.task.parent_id.clone(), doc.task.path_order);
        if taken.contains(&slot) {
            let reason = format!("path_order {} already used by a sibling", doc.task.path_order);
            selection.skipped.push(skip(&doc, reason));
            continue;
        }

        let path = match compute_path(parent_path.as_deref(), doc.task.path_order) {
            Ok(path) => path,
            Err(err) => {
                selection.skipped.push(skip(&doc, err.to_string()));
                continue;
            }
        };

        if path != doc.task.path {
            tracing::debug!(
                task_id = %doc.task.id,
                stored = %doc.task.path,
                derived = %path,
                "document path re-derived from hierarchy"
            );
            selection.repathed.push(doc.task.id.clone());
            doc.task.path.clone_from(&path);
        }

        taken.insert(slot);
        accepted.insert(doc.task.id.clone(), (path, doc.task.level));
        selection.accepted.push(doc);
    }

    selection
}

/// Replace the index contents with `selection` in one transaction.
///
/// # Errors
///
/// Returns an error if any statement fails; the previous contents survive.
pub fn rebuild_index(
    conn: &Connection,
    document_count: usize,
    selection: Selection,
) -> Result<RebuildReport> {
    let start = Instant::now();

    conn.execute_batch("BEGIN IMMEDIATE")
        .context("begin rebuild transaction")?;

    let result = (|| -> Result<usize> {
        clear_index(conn)?;
        for doc in &selection.accepted {
            upsert_task(conn, &doc.task, &doc.hash)?;
        }
        record_rebuild(conn, document_count, now().timestamp_micros())?;
        Ok(selection.accepted.len())
    })();

    let task_count = match result {
        Ok(count) => {
            conn.execute_batch("COMMIT")
                .context("commit rebuild transaction")?;
            count
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(err);
        }
    };

    let elapsed = start.elapsed();
    tracing::info!(
        document_count,
        task_count,
        skipped = selection.skipped.len(),
        elapsed_ms = elapsed.as_millis(),
        "rebuilt task index from documents"
    );

    Ok(RebuildReport {
        document_count,
        task_count,
        skipped: selection.skipped,
        repathed: selection.repathed,
        refreshed: 0,
        elapsed,
    })
}
