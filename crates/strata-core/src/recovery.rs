//! Startup recovery for a project directory.
//!
//! Runs once when a [`Store`](crate::store::Store) opens a project, before
//! the writer thread accepts commands. It handles the leftovers of a crash or
//! of an external process touching the project:
//!
//! - Hidden temp documents from an interrupted commit
//! - An index that cannot be opened or fails `PRAGMA quick_check`
//! - An index that disagrees with the task documents
//!
//! # Recovery Philosophy
//!
//! - **Documents are authoritative**: the index is always the side that
//!   yields, and any disagreement is settled by rebuilding it.
//! - **No silent data loss**: a corrupt index is moved aside as
//!   `index.db.corrupt`, never deleted outright.
//! - **Quiet when healthy**: a consistent project opens without rewriting
//!   anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::db::rebuild::RebuildReport;
use crate::db::{self, INDEX_FILE};
use crate::doc::DocStore;
use crate::error::{Result, StoreError};
use crate::lock::ProjectLock;
use crate::sync::{Engine, LOCK_FILE, TASKS_DIR};

/// Suffix of a quarantined index file.
pub const CORRUPT_SUFFIX: &str = "corrupt";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What startup recovery had to do.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Stale temp documents removed from the tasks directory.
    pub temps_removed: usize,
    /// Where a corrupt index was moved, if one was found.
    pub quarantined: Option<PathBuf>,
    /// Present when the index had to be rebuilt from the documents.
    pub rebuilt: Option<RebuildReport>,
}

impl RecoveryReport {
    /// `true` when the project opened without any repair.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.temps_removed == 0 && self.quarantined.is_none() && self.rebuilt.is_none()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Open the engine for `project_dir`, repairing whatever a previous run left
/// behind.
///
/// # Errors
///
/// `Busy` if another process holds the project lock, `StorageUnavailable`
/// for file-system failures, `Index` if even a fresh index cannot be built.
pub(crate) fn open_engine(
    project: &str,
    project_dir: &Path,
    config: StoreConfig,
) -> Result<(Engine, RecoveryReport)> {
    let start = Instant::now();
    let docs = DocStore::new(project_dir.join(TASKS_DIR));
    docs.ensure_dir()
        .map_err(|e| StoreError::storage("create tasks directory", e))?;

    let _lock = ProjectLock::acquire(&project_dir.join(LOCK_FILE), config.sync.lock_timeout())?;
    let mut report = RecoveryReport {
        temps_removed: docs
            .cleanup_temps()
            .map_err(|e| StoreError::storage("remove stale temp documents", e))?,
        ..RecoveryReport::default()
    };

    let index_path = project_dir.join(INDEX_FILE);
    let conn = match open_checked(&index_path) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(
                project,
                path = %index_path.display(),
                error = %format!("{err:#}"),
                "index unusable; quarantining and rebuilding from documents"
            );
            report.quarantined = Some(quarantine_index(&index_path)?);
            db::open_index(&index_path)?
        }
    };

    let engine = Engine::new(project, project_dir, conn, config);
    if report.quarantined.is_some() || !engine.index_matches_documents()? {
        let rebuilt = engine.rebuild_locked()?;
        tracing::info!(
            project,
            tasks = rebuilt.task_count,
            skipped = rebuilt.skipped.len(),
            refreshed = rebuilt.refreshed,
            "index rebuilt during startup"
        );
        report.rebuilt = Some(rebuilt);
    }

    if !report.is_clean() {
        tracing::info!(
            project,
            temps_removed = report.temps_removed,
            quarantined = report.quarantined.is_some(),
            rebuilt = report.rebuilt.is_some(),
            elapsed_ms = start.elapsed().as_millis(),
            "startup recovery finished"
        );
    }
    Ok((engine, report))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_checked(path: &Path) -> anyhow::Result<Connection> {
    let conn = db::open_index(path)?;
    if db::quick_check(&conn)? {
        Ok(conn)
    } else {
        anyhow::bail!("quick_check reported damage")
    }
}

/// Move the index aside (replacing an older quarantine) and drop its WAL
/// companions so the next open starts empty.
fn quarantine_index(path: &Path) -> Result<PathBuf> {
    let target = sibling(path, CORRUPT_SUFFIX);
    match fs::rename(path, &target) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(StoreError::storage("quarantine corrupt index", err)),
    }
    for companion in ["wal", "shm"] {
        let side = PathBuf::from(format!("{}-{companion}", path.display()));
        match fs::remove_file(&side) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::storage("remove index journal", err)),
        }
    }
    Ok(target)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Level, NewTask};

    fn open(dir: &Path) -> (Engine, RecoveryReport) {
        open_engine("px", dir, StoreConfig::default()).unwrap()
    }

    #[test]
    fn fresh_project_opens_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, report) = open(dir.path());
        assert!(report.is_clean());
        assert!(engine.docs().dir().is_dir());
    }

    #[test]
    fn stale_temps_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = dir.path().join(TASKS_DIR);
        fs::create_dir_all(&tasks).unwrap();
        fs::write(tasks.join(".tk-0000000000.md.tmp"), "half a doc").unwrap();

        let (_engine, report) = open(dir.path());
        assert_eq!(report.temps_removed, 1);
        assert!(!tasks.join(".tk-0000000000.md.tmp").exists());
    }

    #[test]
    fn corrupt_index_is_quarantined_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (engine, _) = open(dir.path());
            engine.create(NewTask::new(Level::Master, "Project X")).unwrap().id
        };
        let index = dir.path().join(INDEX_FILE);
        let _ = fs::remove_file(dir.path().join("index.db-wal"));
        let _ = fs::remove_file(dir.path().join("index.db-shm"));
        fs::write(&index, vec![b'x'; 4096]).unwrap();

        let (engine, report) = open(dir.path());
        assert_eq!(report.quarantined, Some(dir.path().join("index.db.corrupt")));
        assert_eq!(report.rebuilt.as_ref().map(|r| r.task_count), Some(1));
        assert!(crate::db::query::get_task(engine.conn(), &id).unwrap().is_some());
    }

    #[test]
    fn missing_index_is_rebuilt_from_documents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (engine, _) = open(dir.path());
            let ms = engine.create(NewTask::new(Level::Master, "Project X")).unwrap();
            engine
                .create(NewTask::new(Level::Epic, "Phase 1").under(&ms.id))
                .unwrap();
        }
        for name in ["index.db", "index.db-wal", "index.db-shm"] {
            let _ = fs::remove_file(dir.path().join(name));
        }

        let (_engine, report) = open(dir.path());
        assert!(report.quarantined.is_none());
        assert_eq!(report.rebuilt.map(|r| r.task_count), Some(2));
    }

    #[test]
    fn consistent_project_is_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (engine, _) = open(dir.path());
            engine.create(NewTask::new(Level::Master, "Project X")).unwrap();
        }
        let (_engine, report) = open(dir.path());
        assert!(report.is_clean());
    }

    #[test]
    fn document_written_while_closed_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let (text, id) = {
            let (engine, _) = open(dir.path());
            let ms = engine.create(NewTask::new(Level::Master, "Project X")).unwrap();
            (engine.docs().read(&ms.id).unwrap().unwrap(), ms.id)
        };
        let file = dir.path().join(TASKS_DIR).join(format!("{id}.md"));
        fs::write(&file, text.replace("status: todo", "status: blocked")).unwrap();

        let (engine, report) = open(dir.path());
        assert!(report.rebuilt.is_some());
        let task = crate::db::query::get_task(engine.conn(), &id).unwrap().unwrap();
        assert_eq!(task.status, crate::model::Status::Blocked);
    }
}
