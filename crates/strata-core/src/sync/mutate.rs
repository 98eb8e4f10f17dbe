//! Hierarchy mutations: create, move, update, delete.
//!
//! Each public entry point takes the project lock, validates against the
//! current index before anything is written, then commits one plan.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::engine::{ACTION_REPATHED, Engine, Moved, Plan};
use super::overlay::Overlay;
use super::validate;
use crate::doc::{DocStore, content_hash};
use crate::error::{Result, StoreError};
use crate::model::{Level, NewTask, Task, TaskChanges};
use crate::path::{self, compute_path, detect_cycle, recompute_descendant_paths, validate_level_transition};

const ACTION_CREATED: &str = "created";
const ACTION_MOVED: &str = "moved";
const ACTION_UPDATED: &str = "updated";

/// Hex digits of the digest kept in a task id.
const ID_HEX_LEN: usize = 10;

impl Engine {
    /// Create a task at `new.level` under `new.parent_id`.
    ///
    /// # Errors
    ///
    /// `ParentNotFound`, `InvalidLevelAdjacency`, `MaxDepthExceeded` or
    /// `InvalidField` before anything is written; `StorageUnavailable` or
    /// `Busy` from the write itself.
    pub fn create(&self, new: NewTask) -> Result<Task> {
        let _lock = self.lock()?;
        self.retrying(|engine| engine.create_locked(&new))
    }

    fn create_locked(&self, new: &NewTask) -> Result<Task> {
        let title = validate::title(&new.title)?;
        let description = validate::description(&new.description)?;
        let tags = validate::tags(&new.tags)?;
        let estimated_hours = validate::hours("estimated_hours", new.estimated_hours)?;
        let actual_hours = validate::hours("actual_hours", new.actual_hours)?;
        let completion_percentage = match new.completion_percentage {
            Some(value) => validate::completion(new.level, value)?,
            None if new.level == Level::Subtask && new.status.is_done() => 100,
            None => 0,
        };

        let mut plan = self.plan();
        let parent = match new.parent_id.as_deref() {
            Some(parent_id) => Some(
                plan.overlay
                    .get(parent_id)?
                    .ok_or_else(|| StoreError::ParentNotFound(parent_id.to_string()))?,
            ),
            None => None,
        };
        validate_level_transition(new.level, parent.as_ref().map(|p| p.level))?;

        let order = plan.overlay.next_order(new.parent_id.as_deref())?;
        let path = compute_path(parent.as_ref().map(|p| p.path.as_str()), order)?;
        let id = generate_id(&plan.overlay, self.docs(), new.level, self.project(), &title, plan.at)?;
        let dependencies = validate::dependencies(&id, &new.dependencies)?;

        let mut task = Task {
            id: id.clone(),
            level: new.level,
            parent_id: new.parent_id.clone(),
            path,
            path_order: order,
            project: self.project().to_string(),
            title,
            description,
            status: new.status,
            priority: new.priority,
            tags,
            estimated_hours,
            actual_hours,
            completion_percentage,
            dependencies,
            checklist: validate::checklist(&new.checklist),
            metadata: new.metadata.clone(),
            created_at: plan.at,
            updated_at: plan.at,
            activity_log: Vec::new(),
        };
        let detail = format!(
            "level={} parent={}",
            task.level,
            task.parent_id.as_deref().unwrap_or("-")
        );
        task.record(ACTION_CREATED, detail, plan.at);
        plan.overlay.stage(task);
        self.propagate(&mut plan, new.parent_id.as_deref())?;

        let mut committed = self.commit(plan)?;
        let task = committed
            .take(&id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        tracing::info!(
            project = %self.project(),
            task_id = %task.id,
            level = %task.level,
            path = %task.path,
            "created task"
        );
        Ok(task)
    }

    /// Re-parent a task, re-pathing its whole subtree.
    ///
    /// `None` re-appends a master as the last root; other levels always need
    /// a parent. Moving a task under its current parent changes nothing.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `ParentNotFound`, `CycleDetected`,
    /// `InvalidLevelAdjacency` or `MaxDepthExceeded` before anything is
    /// written; `StorageUnavailable` or `Busy` from the write itself.
    pub fn move_task(&self, task_id: &str, new_parent: Option<&str>) -> Result<Moved> {
        let _lock = self.lock()?;
        self.retrying(|engine| engine.move_locked(task_id, new_parent))
    }

    fn move_locked(&self, task_id: &str, new_parent: Option<&str>) -> Result<Moved> {
        let mut plan = self.plan();
        let task = plan
            .overlay
            .get(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let parent = match new_parent {
            Some(parent_id) => Some(
                plan.overlay
                    .get(parent_id)?
                    .ok_or_else(|| StoreError::ParentNotFound(parent_id.to_string()))?,
            ),
            None => None,
        };
        check_placement(&plan.overlay, &task, parent.as_ref())?;

        if task.parent_id.as_deref() == new_parent {
            return Ok(Moved {
                task,
                descendants: Vec::new(),
            });
        }

        let order = plan.overlay.next_order(new_parent)?;
        let new_path = compute_path(parent.as_ref().map(|p| p.path.as_str()), order)?;
        let old_parent = task.parent_id.clone();
        let subtree_ids = relocate(&mut plan, task, new_parent, order, &new_path)?;

        self.propagate(&mut plan, old_parent.as_deref())?;
        self.propagate(&mut plan, new_parent)?;

        let mut committed = self.commit(plan)?;
        let task = committed
            .take(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let descendants: Vec<Task> = subtree_ids
            .iter()
            .skip(1)
            .filter_map(|id| committed.take(id))
            .collect();

        tracing::info!(
            project = %self.project(),
            task_id,
            from = old_parent.as_deref().unwrap_or("-"),
            to = new_parent.unwrap_or("-"),
            path = %task.path,
            descendants = descendants.len(),
            "moved task"
        );
        Ok(Moved { task, descendants })
    }

    /// Apply field changes to one task.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `ImmutableFieldChange` or `InvalidField` before
    /// anything is written; `StorageUnavailable` or `Busy` from the write.
    pub fn update(&self, task_id: &str, changes: &TaskChanges) -> Result<Task> {
        let _lock = self.lock()?;
        self.retrying(|engine| engine.update_locked(task_id, changes))
    }

    fn update_locked(&self, task_id: &str, changes: &TaskChanges) -> Result<Task> {
        let mut plan = self.plan();
        let current = plan
            .overlay
            .get(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let mut next = current.clone();
        let changed = validate::apply_changes(&mut next, changes)?;
        if changed.is_empty() {
            return Ok(current);
        }
        next.record(ACTION_UPDATED, format!("fields: {}", changed.join(", ")), plan.at);

        if self.has_newer_hand_edit(task_id, plan.at)? {
            return self.yield_to_hand_edit(&next, plan.at);
        }

        let status_changed = next.status != current.status;
        let parent_id = next.parent_id.clone();
        plan.overlay.stage(next);
        if status_changed {
            self.propagate(&mut plan, parent_id.as_deref())?;
        }

        let mut committed = self.commit(plan)?;
        let task = committed
            .take(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        tracing::info!(
            project = %self.project(),
            task_id,
            fields = %changed.join(","),
            "updated task"
        );
        Ok(task)
    }

    /// Whether the document holds an unreconciled hand edit stamped later
    /// than `at`.
    fn has_newer_hand_edit(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let Some(text) = self
            .docs()
            .read(task_id)
            .map_err(|e| StoreError::storage(format!("read document for '{task_id}'"), e))?
        else {
            return Ok(false);
        };
        let indexed = crate::db::query::content_hash(self.conn(), task_id)?;
        if indexed.as_deref() == Some(content_hash(&text).as_str()) {
            return Ok(false);
        }
        let file = self.docs().file_for(task_id);
        Ok(DocStore::load_text(&file, &text).is_ok_and(|doc| doc.task.updated_at > at))
    }

    /// Keep the rejected mutation as a backup and fold the hand edit in.
    fn yield_to_hand_edit(&self, rejected: &Task, at: DateTime<Utc>) -> Result<Task> {
        let text = crate::doc::render(rejected)
            .map_err(|e| StoreError::invalid("document", e.to_string()))?;
        let backup = self
            .docs()
            .backup(&rejected.id, &text, at)
            .map_err(|e| StoreError::storage(format!("back up update of '{}'", rejected.id), e))?;
        tracing::warn!(
            task_id = %rejected.id,
            backup = %backup.display(),
            "document on disk is newer than the update; keeping the hand edit"
        );

        self.reconcile_locked(vec![self.docs().file_for(&rejected.id)])?;
        crate::db::query::get_task(self.conn(), &rejected.id)?
            .ok_or_else(|| StoreError::TaskNotFound(rejected.id.clone()))
    }

    /// Delete a task and its whole subtree, documents included.
    ///
    /// Returns the removed ids in path order.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` before anything is written; `StorageUnavailable` or
    /// `Busy` from the write.
    pub fn delete(&self, task_id: &str) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        self.retrying(|engine| engine.delete_locked(task_id))
    }

    fn delete_locked(&self, task_id: &str) -> Result<Vec<String>> {
        let mut plan = self.plan();
        let task = plan
            .overlay
            .get(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let mut subtree = plan.overlay.subtree(task_id)?;
        subtree.sort_by_cached_key(|t| path::sort_key(&t.path));
        for t in &subtree {
            plan.overlay.remove(&t.id);
        }
        self.propagate(&mut plan, task.parent_id.as_deref())?;
        self.commit(plan)?;

        let ids: Vec<String> = subtree.into_iter().map(|t| t.id).collect();
        tracing::info!(
            project = %self.project(),
            task_id,
            removed = ids.len(),
            "deleted task subtree"
        );
        Ok(ids)
    }
}

/// Check that `task` may be placed under `parent` (`None` = project root).
///
/// Masters are checked for cycles first so that "master under its own
/// descendant" reports the cycle; other levels report depth and adjacency
/// first.
pub(crate) fn check_placement(overlay: &Overlay<'_>, task: &Task, parent: Option<&Task>) -> Result<()> {
    let Some(parent) = parent else {
        validate_level_transition(task.level, None)?;
        return Ok(());
    };
    if task.level == Level::Master {
        check_cycle(overlay, &task.id, parent)?;
        validate_level_transition(task.level, Some(parent.level))?;
    } else {
        validate_level_transition(task.level, Some(parent.level))?;
        check_cycle(overlay, &task.id, parent)?;
    }
    Ok(())
}

fn check_cycle(overlay: &Overlay<'_>, task_id: &str, parent: &Task) -> Result<()> {
    let mut parents: HashMap<String, Option<String>> = HashMap::new();
    parents.insert(parent.id.clone(), parent.parent_id.clone());
    for ancestor in overlay.ancestors(&parent.id)? {
        parents.insert(ancestor.id, ancestor.parent_id);
    }
    detect_cycle(task_id, &parent.id, |id| parents.get(id).cloned().flatten())?;
    Ok(())
}

/// Stage `task` under `new_parent` at `order`, re-pathing its subtree.
///
/// Returns the subtree ids, the moved task first.
pub(crate) fn relocate(
    plan: &mut Plan<'_>,
    mut task: Task,
    new_parent: Option<&str>,
    order: u32,
    new_path: &str,
) -> Result<Vec<String>> {
    let at = plan.at;
    let subtree = plan.overlay.subtree(&task.id)?;
    let paths: HashMap<String, String> = recompute_descendant_paths(&task.id, new_path, |_| {
        subtree.iter().map(|t| (t.id.clone(), t.path.clone())).collect()
    })?
    .into_iter()
    .collect();

    let old_path = std::mem::replace(&mut task.path, new_path.to_string());
    let old_parent = std::mem::replace(&mut task.parent_id, new_parent.map(str::to_string));
    task.path_order = order;
    let detail = format!(
        "parent {} -> {}; path {old_path} -> {new_path}",
        old_parent.as_deref().unwrap_or("-"),
        new_parent.unwrap_or("-")
    );
    task.record(ACTION_MOVED, detail, at);

    let mut ids = vec![task.id.clone()];
    let root_id = task.id.clone();
    plan.overlay.stage(task);

    for mut descendant in subtree.into_iter().filter(|t| t.id != root_id) {
        let Some(relocated) = paths.get(&descendant.id) else {
            continue;
        };
        if *relocated == descendant.path {
            continue;
        }
        let detail = format!("path {} -> {relocated}", descendant.path);
        descendant.path.clone_from(relocated);
        descendant.record(ACTION_REPATHED, detail, at);
        ids.push(descendant.id.clone());
        plan.overlay.stage(descendant);
    }
    Ok(ids)
}

/// `<prefix>-<hex>` from a blake3 digest of the task's identity; retried
/// with a bumped attempt counter until it is unused.
fn generate_id(
    overlay: &Overlay<'_>,
    docs: &DocStore,
    level: Level,
    project: &str,
    title: &str,
    at: DateTime<Utc>,
) -> Result<String> {
    let mut attempt: u32 = 0;
    loop {
        let mut hasher = blake3::Hasher::new();
        hasher.update(project.as_bytes());
        hasher.update(&[0]);
        hasher.update(title.as_bytes());
        hasher.update(&at.timestamp_micros().to_le_bytes());
        hasher.update(&attempt.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        let id = format!("{}-{}", level.id_prefix(), &hex[..ID_HEX_LEN]);

        if overlay.get(&id)?.is_none() && !docs.file_for(&id).exists() {
            return Ok(id);
        }
        tracing::debug!(%id, attempt, "task id collision; retrying");
        attempt = attempt.wrapping_add(1);
    }
}
