//! Folding external edits of task documents back into the index.
//!
//! Reconciliation is driven by file paths (from the watcher or a caller) and
//! is idempotent: a document whose hash matches the index is left alone, so
//! replaying the same event changes nothing.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use serde::Serialize;

use super::engine::{ACTION_CONFLICT, Engine, Plan, file_name};
use super::mutate::{check_placement, relocate};
use super::overlay::Overlay;
use super::validate;
use crate::db::query;
use crate::db::rebuild::SkippedDocument;
use crate::doc::{DocStore, LoadedDoc, content_hash};
use crate::error::{Result, StoreError};
use crate::model::Task;
use crate::path::compute_path;
use crate::rollup::Rollup;

const ACTION_EXTERNAL_EDIT: &str = "external_edit";

/// Outcome of reconciling a set of changed paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tasks whose document was folded into the index.
    pub applied: Vec<String>,
    /// Tasks dropped from the index because their document is gone.
    pub removed: Vec<String>,
    /// Documents whose content already matched the index.
    pub unchanged: usize,
    /// Documents left out of the index, and why.
    pub skipped: Vec<SkippedDocument>,
    /// Backups written for edits that lost a conflict.
    pub conflicts: Vec<PathBuf>,
    /// Whether a full rebuild ran to pick up orphaned documents.
    pub rebuilt: bool,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
            && self.removed.is_empty()
            && self.skipped.is_empty()
            && self.conflicts.is_empty()
            && !self.rebuilt
    }
}

enum Outcome {
    Applied,
    Adopted,
    Removed,
    Unchanged,
    Skipped(String),
    Conflict(PathBuf),
}

impl Engine {
    /// Fold the documents at `paths` into the index.
    ///
    /// Paths that are not task documents of this project are ignored.
    ///
    /// # Errors
    ///
    /// `Busy`, `StorageUnavailable`, or `Index` if the index cannot be
    /// brought in line even by a rebuild. Problems with individual documents
    /// are reported in [`ReconcileReport::skipped`], not as errors.
    pub fn reconcile(&self, paths: Vec<PathBuf>) -> Result<ReconcileReport> {
        let _lock = self.lock()?;
        self.reconcile_locked(paths)
    }

    pub(crate) fn reconcile_locked(&self, paths: Vec<PathBuf>) -> Result<ReconcileReport> {
        let ids: BTreeSet<String> = paths.iter().filter_map(|p| self.docs().id_for(p)).collect();
        let mut report = ReconcileReport::default();
        let mut adopted = false;

        for id in ids {
            let outcome = self.retrying(|engine| engine.reconcile_one(&id))?;
            match outcome {
                Outcome::Applied => report.applied.push(id),
                Outcome::Adopted => {
                    adopted = true;
                    report.applied.push(id);
                }
                Outcome::Removed => report.removed.push(id),
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Skipped(reason) => report.skipped.push(SkippedDocument {
                    file: self.docs().file_for(&id),
                    reason,
                }),
                Outcome::Conflict(backup) => {
                    report.applied.push(id);
                    report.conflicts.push(backup);
                }
            }
        }

        if adopted && self.has_unindexed_documents(&report)? {
            tracing::info!(
                project = %self.project(),
                "unindexed documents remain after adopting a new one; rebuilding"
            );
            self.rebuild_locked()?;
            report.rebuilt = true;
        }

        if !report.is_noop() {
            tracing::info!(
                project = %self.project(),
                applied = report.applied.len(),
                removed = report.removed.len(),
                skipped = report.skipped.len(),
                conflicts = report.conflicts.len(),
                "reconciled external edits"
            );
        }
        Ok(report)
    }

    fn reconcile_one(&self, task_id: &str) -> Result<Outcome> {
        let text = self
            .docs()
            .read(task_id)
            .map_err(|e| StoreError::storage(format!("read document for '{task_id}'"), e))?;
        let indexed = query::get_task(self.conn(), task_id)?;

        let Some(text) = text else {
            if indexed.is_none() {
                return Ok(Outcome::Unchanged);
            }
            self.unindex(task_id, "document removed")?;
            return Ok(Outcome::Removed);
        };

        let hash = content_hash(&text);
        if query::content_hash(self.conn(), task_id)?.as_deref() == Some(hash.as_str()) {
            return Ok(Outcome::Unchanged);
        }

        let file = self.docs().file_for(task_id);
        let loaded = DocStore::load_text(&file, &text)
            .map_err(|e| e.to_string())
            .and_then(|doc| {
                if doc.task.project == self.project() {
                    Ok(doc)
                } else {
                    Err(format!("belongs to project '{}'", doc.task.project))
                }
            })
            .and_then(|doc| {
                validate::document(&doc.task)
                    .map(|()| doc)
                    .map_err(|e| e.to_string())
            });
        let doc = match loaded {
            Ok(doc) => doc,
            Err(reason) => {
                tracing::warn!(
                    task_id,
                    path = %file.display(),
                    reason = %reason,
                    "excluding task document from index until it is fixed"
                );
                if indexed.is_some() {
                    self.unindex(task_id, "document is malformed")?;
                }
                return Ok(Outcome::Skipped(reason));
            }
        };

        match indexed {
            None => self.adopt(doc),
            Some(current) => self.fold(current, doc, &text),
        }
    }

    /// Drop a task's row and its descendants' rows, keeping every document.
    fn unindex(&self, task_id: &str, reason: &str) -> Result<()> {
        let mut plan = self.plan();
        let subtree = plan.overlay.subtree(task_id)?;
        let parent = subtree.first().and_then(|t| t.parent_id.clone());
        for task in &subtree {
            plan.overlay.remove(&task.id);
            plan.unindexed.insert(task.id.clone());
        }
        if subtree.len() > 1 {
            tracing::warn!(
                task_id,
                orphans = subtree.len() - 1,
                "descendant documents left unindexed until their parent returns"
            );
        }
        self.propagate(&mut plan, parent.as_deref())?;
        self.commit(plan)?;
        tracing::warn!(task_id, reason, "dropped task from index");
        Ok(())
    }

    /// Index a document that appeared on disk.
    fn adopt(&self, doc: LoadedDoc) -> Result<Outcome> {
        let mut plan = self.plan();
        let mut task = doc.task;

        let parent = match task.parent_id.as_deref() {
            Some(parent_id) => match plan.overlay.get(parent_id)? {
                Some(parent) => Some(parent),
                None => {
                    return Ok(skipped(&task, format!("parent '{parent_id}' is not indexed")));
                }
            },
            None => None,
        };
        if let Err(err) = check_placement(&plan.overlay, &task, parent.as_ref()) {
            return Ok(skipped(&task, err.to_string()));
        }

        let order = free_order(&plan.overlay, task.parent_id.as_deref(), task.path_order)?;
        let path = match compute_path(parent.as_ref().map(|p| p.path.as_str()), order) {
            Ok(path) => path,
            Err(err) => return Ok(skipped(&task, err.to_string())),
        };
        task.path = path;
        task.path_order = order;
        if task.level.has_derived_completion() {
            task.completion_percentage = Rollup::of(&plan.overlay.children(Some(&task.id))?).percentage();
        }
        task.record(ACTION_EXTERNAL_EDIT, "indexed new document", plan.at);

        let parent_id = task.parent_id.clone();
        plan.folded.insert(task.id.clone());
        plan.overlay.stage(task);
        self.propagate(&mut plan, parent_id.as_deref())?;
        self.commit(plan)?;
        Ok(Outcome::Adopted)
    }

    /// Fold a changed document of an indexed task.
    fn fold(&self, current: Task, doc: LoadedDoc, text: &str) -> Result<Outcome> {
        let mut plan = self.plan();
        let at = plan.at;
        let mut edited = doc.task;
        let written = (edited.path.clone(), edited.path_order);

        if current.updated_at > edited.updated_at {
            return self.quarantine(plan, current, text, "index is newer than the hand edit");
        }
        if edited.level != current.level {
            let reason = format!("level cannot change ({} -> {})", current.level, edited.level);
            return self.quarantine(plan, current, text, &reason);
        }

        let parent_changed = edited.parent_id != current.parent_id;
        if parent_changed {
            let parent = match edited.parent_id.as_deref() {
                Some(parent_id) => match plan.overlay.get(parent_id)? {
                    Some(parent) => Some(parent),
                    None => {
                        let reason = format!("parent '{parent_id}' not found");
                        return self.quarantine(plan, current, text, &reason);
                    }
                },
                None => None,
            };
            if let Err(err) = check_placement(&plan.overlay, &current, parent.as_ref()) {
                return self.quarantine(plan, current, text, &err.to_string());
            }

            let order = free_order(&plan.overlay, edited.parent_id.as_deref(), edited.path_order)?;
            let new_path = match compute_path(parent.as_ref().map(|p| p.path.as_str()), order) {
                Ok(path) => path,
                Err(err) => return self.quarantine(plan, current, text, &err.to_string()),
            };
            // Re-path the indexed subtree; the edited task itself is staged on top.
            relocate(&mut plan, current.clone(), edited.parent_id.as_deref(), order, &new_path)?;
            edited.path = new_path;
            edited.path_order = order;
        } else {
            edited.path.clone_from(&current.path);
            edited.path_order = current.path_order;
        }

        if edited.level.has_derived_completion() {
            let children = plan.overlay.children(Some(&edited.id))?;
            edited.completion_percentage = Rollup::of(&children).percentage();
        }

        let changed = validate::changed_fields(&current, &edited);
        if changed.is_empty() && (edited.path.clone(), edited.path_order) == written {
            // Formatting-only edit: refresh the stored row, leave the file be.
            plan.rehashed.push((edited, content_hash(text)));
            self.commit(plan)?;
            return Ok(Outcome::Applied);
        }

        let detail = if changed.is_empty() {
            "derived fields corrected".to_string()
        } else {
            format!("fields: {}", changed.join(", "))
        };
        edited.record(ACTION_EXTERNAL_EDIT, detail, at);
        let status_changed = edited.status != current.status;
        let new_parent = edited.parent_id.clone();
        plan.folded.insert(edited.id.clone());
        plan.overlay.stage(edited);

        if parent_changed {
            self.propagate(&mut plan, current.parent_id.as_deref())?;
            self.propagate(&mut plan, new_parent.as_deref())?;
        } else if status_changed {
            self.propagate(&mut plan, new_parent.as_deref())?;
        }
        self.commit(plan)?;
        Ok(Outcome::Applied)
    }

    /// Keep the indexed version: back up the disk text and restore the
    /// document from the index.
    fn quarantine(&self, mut plan: Plan<'_>, mut current: Task, text: &str, reason: &str) -> Result<Outcome> {
        let at = plan.at;
        let backup = self
            .docs()
            .backup(&current.id, text, at)
            .map_err(|e| StoreError::storage(format!("back up hand edit of '{}'", current.id), e))?;
        tracing::warn!(
            task_id = %current.id,
            backup = %backup.display(),
            reason,
            "rejected hand edit; restored indexed version"
        );
        current.record(
            ACTION_CONFLICT,
            format!("{reason}; edit kept in {}", file_name(&backup)),
            at,
        );
        plan.folded.insert(current.id.clone());
        plan.overlay.stage(current);
        self.commit(plan)?;
        Ok(Outcome::Conflict(backup))
    }

    /// Whether any document on disk is neither indexed nor known-bad.
    fn has_unindexed_documents(&self, report: &ReconcileReport) -> Result<bool> {
        let on_disk = self
            .docs()
            .list_ids()
            .map_err(|e| StoreError::storage("list task documents", e))?;
        let indexed = query::content_hashes(self.conn())?;
        let skipped: HashSet<&PathBuf> = report.skipped.iter().map(|s| &s.file).collect();
        Ok(on_disk.iter().any(|id| {
            !indexed.contains_key(id) && !skipped.contains(&self.docs().file_for(id))
        }))
    }
}

/// Keep `wanted` when it is free among the siblings, else append.
fn free_order(overlay: &Overlay<'_>, parent_id: Option<&str>, wanted: u32) -> Result<u32> {
    let siblings = overlay.children(parent_id)?;
    if wanted > 0 && !siblings.iter().any(|s| s.path_order == wanted) {
        return Ok(wanted);
    }
    Ok(overlay.next_order(parent_id)?)
}

fn skipped(task: &Task, reason: String) -> Outcome {
    tracing::warn!(
        task_id = %task.id,
        reason = %reason,
        "excluding task document from index until it is fixed"
    );
    Outcome::Skipped(reason)
}
