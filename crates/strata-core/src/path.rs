//! Materialized path engine.
//!
//! Pure functions over the hierarchy encoding; nothing here touches the
//! filesystem or the index. Collaborators supply lookups as closures.
//!
//! A path is a dot-separated list of one-based sibling order keys, e.g.
//! `1.1.3` is the third child of the first child of the first root. Because
//! segments are integers, lexical order is not tree order; [`sort_key`]
//! produces a zero-padded key that is.

use std::collections::HashSet;

use crate::error::StoreError;
use crate::model::Level;

/// Maximum number of levels in the hierarchy.
pub const MAX_DEPTH: usize = 4;

/// Width of a zero-padded segment in [`sort_key`].
const SORT_SEGMENT_WIDTH: usize = 6;

/// Violations detected by the path engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("{child} cannot be placed under {parent:?}")]
    InvalidLevelAdjacency { child: Level, parent: Option<Level> },
    #[error("moving '{task_id}' under '{proposed_parent}' would create a cycle")]
    CycleDetected {
        task_id: String,
        proposed_parent: String,
    },
    #[error("depth would exceed {} levels", MAX_DEPTH)]
    MaxDepthExceeded,
    #[error("sibling order must be at least 1")]
    InvalidOrder,
}

impl From<PathError> for StoreError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::InvalidLevelAdjacency { child, parent } => {
                Self::InvalidLevelAdjacency { child, parent }
            }
            PathError::CycleDetected {
                task_id,
                proposed_parent,
            } => Self::CycleDetected {
                task_id,
                proposed_parent,
            },
            PathError::MaxDepthExceeded => Self::MaxDepthExceeded { max: MAX_DEPTH },
            PathError::InvalidOrder => Self::invalid("path_order", "sibling order must be at least 1"),
        }
    }
}

/// Append a segment for `sibling_order` to the parent's path.
///
/// # Errors
///
/// Returns [`PathError::MaxDepthExceeded`] when the result would have more
/// than [`MAX_DEPTH`] segments and [`PathError::InvalidOrder`] for order 0.
pub fn compute_path(parent_path: Option<&str>, sibling_order: u32) -> Result<String, PathError> {
    if sibling_order == 0 {
        return Err(PathError::InvalidOrder);
    }
    match parent_path {
        None => Ok(sibling_order.to_string()),
        Some(parent) => {
            if depth(parent) >= MAX_DEPTH {
                return Err(PathError::MaxDepthExceeded);
            }
            Ok(format!("{parent}.{sibling_order}"))
        }
    }
}

/// Check that `child` may sit directly under `parent` (`None` = project root).
///
/// A subtask parent is reported as a depth violation rather than an adjacency
/// one: nothing can ever be placed below the fourth level.
///
/// # Errors
///
/// Returns [`PathError::MaxDepthExceeded`] or [`PathError::InvalidLevelAdjacency`].
pub fn validate_level_transition(child: Level, parent: Option<Level>) -> Result<(), PathError> {
    if parent == Some(Level::Subtask) {
        return Err(PathError::MaxDepthExceeded);
    }
    if child.parent_level() == parent {
        Ok(())
    } else {
        Err(PathError::InvalidLevelAdjacency { child, parent })
    }
}

/// Walk the ancestor chain of `proposed_parent_id` and fail if `task_id`
/// appears in it (or is the proposed parent itself).
///
/// `parent_of` returns the parent id of a task, or `None` at a root or for an
/// unknown id. A chain that loops back on itself is treated as a cycle.
///
/// # Errors
///
/// Returns [`PathError::CycleDetected`].
pub fn detect_cycle<F>(task_id: &str, proposed_parent_id: &str, mut parent_of: F) -> Result<(), PathError>
where
    F: FnMut(&str) -> Option<String>,
{
    let cycle = || PathError::CycleDetected {
        task_id: task_id.to_string(),
        proposed_parent: proposed_parent_id.to_string(),
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut current = Some(proposed_parent_id.to_string());
    while let Some(id) = current {
        if id == task_id || !visited.insert(id.clone()) {
            return Err(cycle());
        }
        current = parent_of(&id);
    }
    Ok(())
}

/// Compute new paths for a moved task and its whole subtree.
///
/// `subtree_of` returns `(id, current_path)` for every task in the subtree of
/// `task_id`, the task itself included. Each descendant keeps its relative
/// suffix; only the prefix that belonged to the moved task is replaced.
///
/// # Errors
///
/// Returns [`PathError::MaxDepthExceeded`] if any re-pathed descendant would be
/// deeper than [`MAX_DEPTH`].
pub fn recompute_descendant_paths<F>(
    task_id: &str,
    new_path: &str,
    subtree_of: F,
) -> Result<Vec<(String, String)>, PathError>
where
    F: FnOnce(&str) -> Vec<(String, String)>,
{
    let subtree = subtree_of(task_id);
    let Some(old_root) = subtree
        .iter()
        .find(|(id, _)| id == task_id)
        .map(|(_, path)| path.clone())
    else {
        return Ok(vec![(task_id.to_string(), new_path.to_string())]);
    };

    let mut out = Vec::with_capacity(subtree.len());
    for (id, path) in subtree {
        let relocated = if path == old_root {
            new_path.to_string()
        } else if let Some(suffix) = path.strip_prefix(&format!("{old_root}.")) {
            format!("{new_path}.{suffix}")
        } else {
            continue;
        };
        if depth(&relocated) > MAX_DEPTH {
            return Err(PathError::MaxDepthExceeded);
        }
        out.push((id, relocated));
    }
    Ok(out)
}

/// Number of segments in a path.
#[must_use]
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('.').count()
    }
}

/// Parse a path into its integer segments. `None` if any segment is not a
/// positive integer.
#[must_use]
pub fn segments(path: &str) -> Option<Vec<u32>> {
    path.split('.')
        .map(|seg| seg.parse::<u32>().ok().filter(|n| *n > 0))
        .collect()
}

/// Parent path of `path`, or `None` for a root path.
#[must_use]
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(parent, _)| parent)
}

/// Whether `path` lies strictly inside the subtree rooted at `ancestor`.
#[must_use]
pub fn is_descendant_path(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

/// Zero-padded ordering key so that `1.2` sorts before `1.10`.
#[must_use]
pub fn sort_key(path: &str) -> String {
    path.split('.')
        .map(|seg| format!("{seg:0>SORT_SEGMENT_WIDTH$}"))
        .collect::<Vec<_>>()
        .join(".")
}
