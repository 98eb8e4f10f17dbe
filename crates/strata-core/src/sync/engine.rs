//! Mutation pipeline.
//!
//! Every mutation is planned against an [`Overlay`] of the index and then
//! committed in three steps:
//!
//! 1. each changed document is rendered and staged to a hidden temp file;
//! 2. removed documents are deleted and the temps are renamed into place;
//! 3. one index transaction mirrors the new documents.
//!
//! A failure in step 1 leaves nothing behind. A failure in step 3 happens
//! after the documents are already authoritative, so it is healed by a full
//! rebuild instead of being reported.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::overlay::Overlay;
use crate::config::StoreConfig;
use crate::db::query;
use crate::db::rebuild::{RebuildReport, SkippedDocument, rebuild_index, select_consistent};
use crate::db::write::{IndexBatch, IndexWriter};
use crate::doc::{self, DocStore, content_hash};
use crate::doc::fs::Staged;
use crate::error::{Result, StoreError};
use crate::lock::ProjectLock;
use crate::model::{Level, Task, now};
use crate::rollup::{self, Rollup, RollupPolicy};

/// Advisory lock file inside a project directory.
pub const LOCK_FILE: &str = "store.lock";

/// Directory holding the task documents inside a project directory.
pub const TASKS_DIR: &str = "tasks";

pub(crate) const ACTION_CONFLICT: &str = "conflict";
pub(crate) const ACTION_REPATHED: &str = "repathed";

/// A moved task together with its re-pathed descendants (parents first).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Moved {
    pub task: Task,
    pub descendants: Vec<Task>,
}

/// Planned changes for one mutation.
pub(crate) struct Plan<'conn> {
    pub overlay: Overlay<'conn>,
    /// Mutation timestamp shared by every activity entry of the plan.
    pub at: DateTime<Utc>,
    /// Tasks whose document on disk is being adopted as-is.
    pub folded: HashSet<String>,
    /// Removed rows whose documents stay on disk.
    pub unindexed: HashSet<String>,
    /// Rows refreshed from an unchanged task whose document text differs.
    pub rehashed: Vec<(Task, String)>,
}

/// What a committed plan wrote.
#[derive(Debug, Default)]
pub(crate) struct Committed {
    pub tasks: Vec<Task>,
    pub removed: Vec<String>,
    pub backups: Vec<PathBuf>,
}

impl Committed {
    pub fn take(&mut self, task_id: &str) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id == task_id)?;
        Some(self.tasks.swap_remove(pos))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnIndexError {
    Rebuild,
    Fail,
}

/// Owner of one project's documents and its write connection.
///
/// Lives on the writer thread; nothing else writes to the project.
pub struct Engine {
    project: String,
    docs: DocStore,
    conn: Connection,
    index_path: PathBuf,
    lock_path: PathBuf,
    config: StoreConfig,
}

impl Engine {
    pub(crate) fn new(
        project: impl Into<String>,
        project_dir: &Path,
        conn: Connection,
        config: StoreConfig,
    ) -> Self {
        Self {
            project: project.into(),
            docs: DocStore::new(project_dir.join(TASKS_DIR)),
            conn,
            index_path: project_dir.join(crate::db::INDEX_FILE),
            lock_path: project_dir.join(LOCK_FILE),
            config,
        }
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    #[must_use]
    pub const fn docs(&self) -> &DocStore {
        &self.docs
    }

    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub(crate) const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn lock(&self) -> Result<ProjectLock> {
        ProjectLock::acquire(&self.lock_path, self.config.sync.lock_timeout())
    }

    pub(crate) const fn policy(&self) -> RollupPolicy {
        RollupPolicy::from_config(&self.config)
    }

    pub(crate) fn plan(&self) -> Plan<'_> {
        Plan {
            overlay: Overlay::new(&self.conn),
            at: now(),
            folded: HashSet::new(),
            unindexed: HashSet::new(),
            rehashed: Vec::new(),
        }
    }

    /// Run `op`; if it trips over the index, rebuild and run it once more.
    pub(crate) fn retrying<T>(&self, op: impl Fn(&Self) -> Result<T>) -> Result<T> {
        match op(self) {
            Err(StoreError::Index(err)) => {
                tracing::warn!(
                    project = %self.project,
                    error = %format!("{err:#}"),
                    "index query failed; rebuilding from documents and retrying"
                );
                self.rebuild_locked()?;
                op(self)
            }
            other => other,
        }
    }

    /// Re-derive completion (and auto transitions) for every ancestor,
    /// starting at `from` and walking up to the project root.
    pub(crate) fn propagate(&self, plan: &mut Plan<'_>, from: Option<&str>) -> Result<()> {
        let policy = self.policy();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = from.map(str::to_string);

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break;
            }
            let Some(mut parent) = plan.overlay.get(&id)? else {
                break;
            };
            let children = plan.overlay.children(Some(&id))?;
            let rollup = Rollup::of(&children);
            current = parent.parent_id.clone();

            let before = parent.status;
            if rollup::apply(&mut parent, &rollup, policy, plan.at) {
                tracing::debug!(
                    task_id = %parent.id,
                    rollup = %rollup,
                    status_from = %before,
                    status_to = %parent.status,
                    "rolled up parent"
                );
                plan.overlay.stage(parent);
            }
        }
        Ok(())
    }

    pub(crate) fn commit(&self, plan: Plan<'_>) -> Result<Committed> {
        self.commit_with(plan, OnIndexError::Rebuild)
    }

    fn commit_with(&self, plan: Plan<'_>, on_index_error: OnIndexError) -> Result<Committed> {
        let Plan {
            overlay,
            at,
            folded,
            unindexed,
            rehashed,
        } = plan;
        let (mut writes, removed) = overlay.into_changes();
        let mut backups = Vec::new();

        for task in &mut writes {
            if folded.contains(&task.id) {
                continue;
            }
            if let Some(path) = self.preserve_hand_edit(&task.id, at)? {
                let detail = format!("unreconciled hand edit preserved in {}", file_name(&path));
                task.record(ACTION_CONFLICT, detail, at);
                backups.push(path);
            }
        }
        let deleted: Vec<&String> = removed.iter().filter(|id| !unindexed.contains(*id)).collect();
        for id in &deleted {
            if let Some(path) = self.preserve_hand_edit(id, at)? {
                backups.push(path);
            }
        }

        let mut staged: Vec<Staged> = Vec::with_capacity(writes.len());
        let mut upserts: Vec<(Task, String)> = Vec::with_capacity(writes.len() + rehashed.len());
        for task in writes {
            let text = match doc::render(&task) {
                Ok(text) => text,
                Err(err) => {
                    self.discard_all(staged);
                    return Err(StoreError::invalid("document", err.to_string()));
                }
            };
            match self.docs.stage(&task.id, &text) {
                Ok(s) => staged.push(s),
                Err(err) => {
                    self.discard_all(staged);
                    return Err(StoreError::storage(
                        format!("write document for '{}'", task.id),
                        err,
                    ));
                }
            }
            upserts.push((task, content_hash(&text)));
        }

        for id in &deleted {
            if let Err(err) = self.docs.remove(id) {
                self.discard_all(staged);
                return Err(StoreError::storage(format!("remove document for '{id}'"), err));
            }
        }

        let mut pending = staged.into_iter();
        while let Some(next) = pending.next() {
            let target = next.target().to_path_buf();
            if let Err(err) = self.docs.publish(next) {
                self.discard_all(pending.by_ref().collect());
                return Err(StoreError::storage(
                    format!("publish {}", target.display()),
                    err,
                ));
            }
        }

        upserts.extend(rehashed);
        let batch = IndexBatch {
            upserts,
            deletes: removed,
        };
        if let Err(err) = IndexWriter::new(&self.conn).apply(&batch) {
            if on_index_error == OnIndexError::Fail {
                return Err(err.into());
            }
            tracing::warn!(
                project = %self.project,
                error = %format!("{err:#}"),
                "index update failed after documents were written; rebuilding from documents"
            );
            if let Err(rebuild_err) = self.rebuild_locked() {
                tracing::error!(
                    project = %self.project,
                    error = %rebuild_err,
                    "index rebuild failed; it will be retried on next open"
                );
            }
        }

        tracing::debug!(
            project = %self.project,
            written = batch.upserts.len(),
            removed = batch.deletes.len(),
            backups = backups.len(),
            "committed mutation"
        );

        Ok(Committed {
            tasks: batch.upserts.into_iter().map(|(task, _)| task).collect(),
            removed: batch.deletes,
            backups,
        })
    }

    /// Back up a document whose text no longer matches what was indexed.
    fn preserve_hand_edit(&self, task_id: &str, at: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let text = self
            .docs
            .read(task_id)
            .map_err(|e| StoreError::storage(format!("read document for '{task_id}'"), e))?;
        let Some(text) = text else {
            return Ok(None);
        };
        let Some(indexed) = query::content_hash(&self.conn, task_id)? else {
            return Ok(None);
        };
        if content_hash(&text) == indexed {
            return Ok(None);
        }

        let path = self
            .docs
            .backup(task_id, &text, at)
            .map_err(|e| StoreError::storage(format!("back up hand edit of '{task_id}'"), e))?;
        tracing::warn!(
            task_id,
            backup = %path.display(),
            "document changed on disk since last sync; preserved before overwrite"
        );
        Ok(Some(path))
    }

    fn discard_all(&self, staged: Vec<Staged>) {
        for s in staged {
            self.docs.discard(s);
        }
    }

    /// Rebuild the index from the documents, holding the project lock.
    ///
    /// # Errors
    ///
    /// `Busy` if the lock is held elsewhere, `StorageUnavailable` if the
    /// tasks directory cannot be read, `Index` if the rebuild fails.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let _lock = self.lock()?;
        self.rebuild_locked()
    }

    pub(crate) fn rebuild_locked(&self) -> Result<RebuildReport> {
        let scan = self
            .docs
            .scan()
            .map_err(|e| StoreError::storage("scan task documents", e))?;
        let document_count = scan.docs.len() + scan.malformed.len();
        let mut skipped: Vec<SkippedDocument> = scan
            .malformed
            .into_iter()
            .map(|(file, reason)| SkippedDocument { file, reason })
            .collect();

        let selection = select_consistent(&self.project, scan.docs);
        let mut report = rebuild_index(&self.conn, document_count, selection)?;
        skipped.append(&mut report.skipped);
        report.skipped = skipped;
        report.refreshed = self.refresh_derived(&report.repathed)?;
        Ok(report)
    }

    /// Rewrite documents whose derived fields disagree with the rebuilt
    /// index: re-derived paths and completion values. Statuses are left as
    /// the documents state them.
    fn refresh_derived(&self, repathed: &[String]) -> Result<usize> {
        let mut plan = self.plan();

        for id in repathed {
            if let Some(mut task) = plan.overlay.get(id)? {
                let detail = format!("path re-derived as {}", task.path);
                task.record(ACTION_REPATHED, detail, plan.at);
                plan.overlay.stage(task);
            }
        }

        let tasks = query::all_tasks(&self.conn)?;
        for level in [Level::Task, Level::Epic, Level::Master] {
            for id in tasks.iter().filter(|t| t.level == level).map(|t| &t.id) {
                let Some(mut task) = plan.overlay.get(id)? else {
                    continue;
                };
                let pct = Rollup::of(&plan.overlay.children(Some(id))?).percentage();
                if task.completion_percentage != pct {
                    task.completion_percentage = pct;
                    task.updated_at = task.updated_at.max(plan.at);
                    plan.overlay.stage(task);
                }
            }
        }

        let committed = self.commit_with(plan, OnIndexError::Fail)?;
        if !committed.tasks.is_empty() {
            tracing::info!(
                project = %self.project,
                refreshed = committed.tasks.len(),
                "refreshed derived fields after rebuild"
            );
        }
        Ok(committed.tasks.len())
    }

    /// Whether the index holds exactly the documents a rebuild would produce.
    pub(crate) fn index_matches_documents(&self) -> Result<bool> {
        let scan = self
            .docs
            .scan()
            .map_err(|e| StoreError::storage("scan task documents", e))?;
        let selection = select_consistent(&self.project, scan.docs);
        if !selection.repathed.is_empty() {
            return Ok(false);
        }
        let indexed = query::content_hashes(&self.conn)?;
        Ok(indexed.len() == selection.accepted.len()
            && selection
                .accepted
                .iter()
                .all(|doc| indexed.get(&doc.task.id) == Some(&doc.hash)))
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
