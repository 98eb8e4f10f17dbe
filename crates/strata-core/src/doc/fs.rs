//! On-disk layout of task documents.
//!
//! One `<task-id>.md` per task, directly inside the project's `tasks/`
//! directory. Writes go through hidden `.<task-id>.md.tmp` files that are
//! fsynced and then renamed into place, so a reader never observes a torn
//! document.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::format::{self, DocError};
use crate::model::Task;

const EXTENSION: &str = "md";
const TEMP_SUFFIX: &str = ".tmp";
const CONFLICT_MARKER: &str = ".conflict-";

/// Hex blake3 digest of a document's text.
#[must_use]
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// A document read and parsed from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDoc {
    pub task: Task,
    pub hash: String,
    pub file: PathBuf,
}

/// Why a document on disk could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error("document declares id '{declared}' but is named after '{expected}'")]
    IdMismatch { declared: String, expected: String },
}

/// Result of scanning the whole tasks directory.
#[derive(Debug, Default)]
pub struct Scan {
    pub docs: Vec<LoadedDoc>,
    pub malformed: Vec<(PathBuf, String)>,
}

/// A document written to its temp file and waiting to be published.
#[derive(Debug)]
pub struct Staged {
    temp: PathBuf,
    target: PathBuf,
}

impl Staged {
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Filesystem access for one project's task documents.
#[derive(Debug, Clone)]
pub struct DocStore {
    dir: PathBuf,
}

impl DocStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the tasks directory if needed.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    #[must_use]
    pub fn file_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.{EXTENSION}"))
    }

    /// Task id named by a document path, if `path` is a document of this
    /// store: a visible `*.md` file directly inside the tasks directory.
    #[must_use]
    pub fn id_for(&self, path: &Path) -> Option<String> {
        let parent = path.parent()?;
        if parent != self.dir && parent.canonicalize().ok().as_deref() != Some(self.dir.as_path()) {
            return None;
        }
        id_from_file_name(path)
    }

    /// Read a document's raw text, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than "not found".
    pub fn read(&self, task_id: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.file_for(task_id)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read and parse one document, checking that it is named after its id.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] for unreadable, malformed, or misnamed files.
    pub fn load(&self, file: &Path) -> Result<LoadedDoc, LoadError> {
        let text = fs::read_to_string(file)?;
        Self::load_text(file, &text)
    }

    /// Parse already-read document text as if it lived at `file`.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] for malformed or misnamed documents.
    pub fn load_text(file: &Path, text: &str) -> Result<LoadedDoc, LoadError> {
        let task = format::parse(text)?;
        if let Some(expected) = id_from_file_name(file) {
            if expected != task.id {
                return Err(LoadError::IdMismatch {
                    declared: task.id,
                    expected,
                });
            }
        }
        Ok(LoadedDoc {
            task,
            hash: content_hash(text),
            file: file.to_path_buf(),
        })
    }

    /// Ids of every document file, sorted.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from listing the directory.
    pub fn list_ids(&self) -> io::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .entries()?
            .iter()
            .filter_map(|p| id_from_file_name(p))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load every document; malformed ones are reported, not fatal.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from listing the directory.
    pub fn scan(&self) -> io::Result<Scan> {
        let mut scan = Scan::default();
        let mut files: Vec<PathBuf> = self
            .entries()?
            .into_iter()
            .filter(|p| id_from_file_name(p).is_some())
            .collect();
        files.sort();

        for file in files {
            match self.load(&file) {
                Ok(doc) => scan.docs.push(doc),
                Err(err) => {
                    tracing::warn!(
                        path = %file.display(),
                        error = %err,
                        "skipping malformed task document"
                    );
                    scan.malformed.push((file, err.to_string()));
                }
            }
        }
        Ok(scan)
    }

    /// Write `text` to the hidden temp file for `task_id` and fsync it.
    ///
    /// # Errors
    ///
    /// Returns the I/O error; a partially written temp file is removed.
    pub fn stage(&self, task_id: &str, text: &str) -> io::Result<Staged> {
        let target = self.file_for(task_id);
        let temp = self.dir.join(format!(".{task_id}.{EXTENSION}{TEMP_SUFFIX}"));

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()
        };

        if let Err(err) = write() {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        Ok(Staged { temp, target })
    }

    /// Rename a staged temp file over its target.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the rename.
    pub fn publish(&self, staged: Staged) -> io::Result<()> {
        fs::rename(&staged.temp, &staged.target)?;
        self.sync_dir();
        Ok(())
    }

    /// Drop a staged temp file without publishing it.
    pub fn discard(&self, staged: Staged) {
        let _ = fs::remove_file(staged.temp);
    }

    /// Remove a task's document. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than "not found".
    pub fn remove(&self, task_id: &str) -> io::Result<bool> {
        match fs::remove_file(self.file_for(task_id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Preserve conflicting content next to the document as
    /// `<task-id>.md.conflict-<unix_us>`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from writing the backup.
    pub fn backup(&self, task_id: &str, text: &str, at: DateTime<Utc>) -> io::Result<PathBuf> {
        let mut stamp = at.timestamp_micros();
        let mut path;
        loop {
            path = self
                .dir
                .join(format!("{task_id}.{EXTENSION}{CONFLICT_MARKER}{stamp}"));
            if !path.exists() {
                break;
            }
            stamp += 1;
        }
        fs::write(&path, text)?;
        Ok(path)
    }

    /// Conflict backups kept for `task_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from listing the directory.
    pub fn conflicts(&self, task_id: &str) -> io::Result<Vec<PathBuf>> {
        let prefix = format!("{task_id}.{EXTENSION}{CONFLICT_MARKER}");
        let mut found: Vec<PathBuf> = self
            .entries()?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        found.sort();
        Ok(found)
    }

    /// Remove temp files left behind by an interrupted write.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from listing the directory.
    pub fn cleanup_temps(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in self.entries()? {
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX));
            if is_temp && fs::remove_file(&path).is_ok() {
                tracing::info!(path = %path.display(), "removed stale temp document");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn entries(&self) -> io::Result<Vec<PathBuf>> {
        match fs::read_dir(&self.dir) {
            Ok(iter) => {
                let mut out = Vec::new();
                for entry in iter {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        out.push(entry.path());
                    }
                }
                Ok(out)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    #[cfg(unix)]
    fn sync_dir(&self) {
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) {}
}

fn id_from_file_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
    if stem.is_empty() || stem.contains('.') {
        return None;
    }
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Level, Priority, Status, now};
    use std::collections::{BTreeMap, BTreeSet};

    fn task(id: &str) -> Task {
        let ts = now();
        Task {
            id: id.into(),
            level: Level::Master,
            parent_id: None,
            path: "1".into(),
            path_order: 1,
            project: "px".into(),
            title: "Project X".into(),
            description: String::new(),
            status: Status::Todo,
            priority: Priority::Medium,
            tags: BTreeSet::new(),
            estimated_hours: None,
            actual_hours: None,
            completion_percentage: 0,
            dependencies: BTreeSet::new(),
            checklist: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: ts,
            updated_at: ts,
            activity_log: Vec::new(),
        }
    }

    #[test]
    fn stage_and_publish_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path().join("tasks"));
        store.ensure_dir().unwrap();

        let text = format::render(&task("ms-0000000001")).unwrap();
        let staged = store.stage("ms-0000000001", &text).unwrap();
        assert!(store.read("ms-0000000001").unwrap().is_none());
        store.publish(staged).unwrap();

        assert_eq!(store.read("ms-0000000001").unwrap().as_deref(), Some(text.as_str()));
        assert_eq!(store.list_ids().unwrap(), vec!["ms-0000000001".to_string()]);
    }

    #[test]
    fn discard_and_cleanup_leave_no_temps() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path());
        let staged = store.stage("ms-1", "x").unwrap();
        store.discard(staged);
        let _left = store.stage("ms-2", "y").unwrap();
        assert_eq!(store.cleanup_temps().unwrap(), 1);
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn scan_reports_malformed_and_misnamed() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path());
        let good = format::render(&task("ms-0000000001")).unwrap();
        fs::write(store.file_for("ms-0000000001"), &good).unwrap();
        fs::write(store.file_for("ms-0000000002"), &good).unwrap();
        fs::write(store.file_for("broken"), "no front matter").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scan = store.scan().unwrap();
        assert_eq!(scan.docs.len(), 1);
        assert_eq!(scan.docs[0].hash, content_hash(&good));
        assert_eq!(scan.malformed.len(), 2);
        assert!(
            scan.malformed
                .iter()
                .any(|(_, reason)| reason.contains("named after 'ms-0000000002'"))
        );
    }

    #[test]
    fn backups_are_not_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path());
        let at = now();
        let first = store.backup("tk-1", "old", at).unwrap();
        let second = store.backup("tk-1", "older", at).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.conflicts("tk-1").unwrap().len(), 2);
        assert!(store.list_ids().unwrap().is_empty());
        assert!(store.id_for(&first).is_none());
    }

    #[test]
    fn id_for_only_accepts_direct_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path());
        assert_eq!(
            store.id_for(&dir.path().join("tk-abc.md")).as_deref(),
            Some("tk-abc")
        );
        assert!(store.id_for(&dir.path().join("sub/tk-abc.md")).is_none());
        assert!(store.id_for(&dir.path().join(".tk-abc.md.tmp")).is_none());
        assert!(store.id_for(&dir.path().join("tk-abc.md.conflict-12")).is_none());
    }

    #[test]
    fn remove_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::new(dir.path());
        fs::write(store.file_for("tk-1"), "x").unwrap();
        assert!(store.remove("tk-1").unwrap());
        assert!(!store.remove("tk-1").unwrap());
    }
}
