//! Hierarchy API.
//!
//! A [`Store`] is one project: mutations are sent to its writer thread and
//! answered over a per-command reply channel, reads open their own index
//! connection. A [`Workspace`] routes project names to stores under one data
//! root.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::{StoreConfig, load_config};
use crate::db::query::{self, SubtreeCounts, TaskFilter};
use crate::db::rebuild::RebuildReport;
use crate::db::{INDEX_FILE, open_reader};
use crate::doc::DocStore;
use crate::error::{Result, StoreError};
use crate::model::{NewTask, Task, TaskChanges};
use crate::recovery::{RecoveryReport, open_engine};
use crate::sync::queue::{Command, Reply, spawn_writer};
use crate::sync::{Moved, ReconcileReport, TASKS_DIR};
use crate::watch::{self, WatchHandle};

/// Directory under the data root holding one directory per project.
pub const PROJECTS_DIR: &str = "projects";

/// Where [`Store::get_tree`] starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeRoot {
    /// Every master of the project.
    Project,
    /// One task and its subtree.
    Task(String),
}

/// A task with its (possibly pruned) children, in sibling order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub task: Task,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Number of nodes in this subtree, itself included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }

    /// Depth-first walk, parents before children.
    pub fn walk(&self) -> impl Iterator<Item = &Task> + '_ {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(&node.task)
        })
    }
}

/// One project's task store.
pub struct Store {
    project: String,
    tasks_dir: PathBuf,
    index_path: PathBuf,
    config: StoreConfig,
    recovery: RecoveryReport,
    commands: Sender<Command>,
    writer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("project", &self.project)
            .field("tasks_dir", &self.tasks_dir)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open `project` under `root` with the root's `config.toml`.
    ///
    /// # Errors
    ///
    /// `ConfigParseError` for an unreadable config, otherwise as
    /// [`Store::open_with`].
    pub fn open(root: &Path, project: &str) -> Result<Self> {
        Self::open_with(root, project, load_config(root)?)
    }

    /// Open `project` under `root`, running startup recovery and starting
    /// the writer thread.
    ///
    /// # Errors
    ///
    /// `InvalidField` for a bad project name, `Busy` if the project is locked
    /// elsewhere, `StorageUnavailable` for file-system failures.
    pub fn open_with(root: &Path, project: &str, config: StoreConfig) -> Result<Self> {
        validate_project(project)?;
        let dir = root.join(PROJECTS_DIR).join(project);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::storage(format!("create project directory {}", dir.display()), e))?;
        let dir = dir
            .canonicalize()
            .map_err(|e| StoreError::storage("resolve project directory", e))?;

        let (engine, recovery) = open_engine(project, &dir, config.clone())?;
        let tasks_dir = engine.docs().dir().to_path_buf();
        let (commands, queue) = mpsc::channel();
        let writer = spawn_writer(engine, queue)
            .map_err(|e| StoreError::storage("start writer thread", e))?;

        tracing::info!(project, dir = %dir.display(), "store opened");
        Ok(Self {
            project: project.to_string(),
            tasks_dir,
            index_path: dir.join(INDEX_FILE),
            config,
            recovery,
            commands,
            writer: Some(writer),
        })
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    #[must_use]
    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// What startup recovery did when this store was opened.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create a task at `new.level` under `new.parent_id`.
    ///
    /// # Errors
    ///
    /// `ParentNotFound`, `InvalidLevelAdjacency`, `MaxDepthExceeded` or
    /// `InvalidField` for bad input; `StorageUnavailable`/`Busy` for I/O.
    pub fn create(&self, new: NewTask) -> Result<Task> {
        self.request(|reply| Command::Create { task: new, reply })
    }

    /// Re-parent a task; `None` makes a master a root again.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `ParentNotFound`, `CycleDetected`,
    /// `InvalidLevelAdjacency` or `MaxDepthExceeded`.
    pub fn move_task(&self, task_id: &str, new_parent: Option<&str>) -> Result<Moved> {
        self.request(|reply| Command::Move {
            task_id: task_id.to_string(),
            parent_id: new_parent.map(str::to_string),
            reply,
        })
    }

    /// Apply field changes to a task.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `ImmutableFieldChange` or `InvalidField`.
    pub fn update(&self, task_id: &str, changes: TaskChanges) -> Result<Task> {
        self.request(|reply| Command::Update {
            task_id: task_id.to_string(),
            changes,
            reply,
        })
    }

    /// Delete a task and its subtree; returns the removed ids in path order.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, or I/O errors removing the documents.
    pub fn delete(&self, task_id: &str) -> Result<Vec<String>> {
        self.request(|reply| Command::Delete {
            task_id: task_id.to_string(),
            reply,
        })
    }

    /// Fold the given document paths into the index now.
    ///
    /// # Errors
    ///
    /// `Busy` or `StorageUnavailable`; per-document problems are reported
    /// in the returned [`ReconcileReport`].
    pub fn reconcile(&self, paths: Vec<PathBuf>) -> Result<ReconcileReport> {
        self.request(|reply| Command::Reconcile {
            paths,
            reply: Some(reply),
        })
    }

    /// Reconcile every document in the tasks directory.
    ///
    /// # Errors
    ///
    /// As [`Store::reconcile`].
    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        let docs = DocStore::new(&self.tasks_dir);
        let ids = docs
            .list_ids()
            .map_err(|e| StoreError::storage("list task documents", e))?;
        self.reconcile(ids.iter().map(|id| docs.file_for(id)).collect())
    }

    /// Drop the index and rebuild it from the documents.
    ///
    /// # Errors
    ///
    /// `Busy`, `StorageUnavailable`, or `Index` if the rebuild fails.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        self.request(|reply| Command::Rebuild { reply })
    }

    /// Start watching the tasks directory for hand edits. Watching stops
    /// when the handle is dropped.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the platform watcher cannot start.
    pub fn watch(&self) -> Result<WatchHandle> {
        watch::spawn(
            &self.project,
            DocStore::new(&self.tasks_dir),
            self.config.sync.debounce(),
            self.commands.clone(),
        )
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::sync_channel(1);
        self.commands
            .send(command(reply))
            .map_err(|_| StoreError::Closed)?;
        response.recv().map_err(|_| StoreError::Closed)?
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// `TaskNotFound` if no such task is indexed.
    pub fn get(&self, task_id: &str) -> Result<Task> {
        self.read(|conn| query::get_task(conn, task_id))?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    /// Direct children of a task in sibling order.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if the task is not indexed.
    pub fn children(&self, task_id: &str) -> Result<Vec<Task>> {
        self.get(task_id)?;
        self.read(|conn| query::get_children(conn, Some(task_id)))
    }

    /// Tasks matching `filter`, in path order.
    ///
    /// # Errors
    ///
    /// `Index` if the index cannot be queried even after a rebuild.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.read(|conn| query::list_tasks(conn, &self.project, filter))
    }

    /// Status counts of everything below `task_id`.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if the task is not indexed.
    pub fn counts(&self, task_id: &str) -> Result<SubtreeCounts> {
        self.get(task_id)?;
        self.read(|conn| query::subtree_counts(conn, task_id))
    }

    /// Ordered forest below `root`.
    ///
    /// `max_depth` counts levels from the root (`Some(1)` returns the roots
    /// alone). With `include_done == false` done tasks are dropped together
    /// with their subtrees.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for an unknown root, `InvalidField` for a zero depth.
    pub fn get_tree(
        &self,
        root: &TreeRoot,
        max_depth: Option<usize>,
        include_done: bool,
    ) -> Result<Vec<TreeNode>> {
        if max_depth == Some(0) {
            return Err(StoreError::invalid("max_depth", "must be at least 1"));
        }
        let (roots, tasks) = match root {
            TreeRoot::Project => {
                let tasks = self.read(query::all_tasks)?;
                let roots = tasks
                    .iter()
                    .filter(|t| t.parent_id.is_none())
                    .map(|t| t.id.clone())
                    .collect();
                (roots, tasks)
            }
            TreeRoot::Task(id) => {
                let tasks = self.read(|conn| query::get_subtree(conn, id))?;
                if tasks.is_empty() {
                    return Err(StoreError::TaskNotFound(id.clone()));
                }
                (vec![id.clone()], tasks)
            }
        };
        Ok(build_forest(&roots, tasks, max_depth.unwrap_or(usize::MAX), include_done))
    }

    /// Run a read on a fresh connection; an index failure triggers one
    /// rebuild and a retry.
    fn read<T>(&self, op: impl Fn(&Connection) -> anyhow::Result<T>) -> Result<T> {
        match self.read_once(&op) {
            Err(StoreError::Index(err)) => {
                tracing::warn!(
                    project = %self.project,
                    error = %format!("{err:#}"),
                    "index read failed; rebuilding"
                );
                self.rebuild()?;
                self.read_once(&op)
            }
            other => other,
        }
    }

    fn read_once<T>(&self, op: &impl Fn(&Connection) -> anyhow::Result<T>) -> Result<T> {
        let conn = open_reader(&self.index_path)?;
        Ok(op(&conn)?)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(Err(_)) = self.writer.take().map(JoinHandle::join) {
            tracing::error!(project = %self.project, "writer thread panicked");
        }
    }
}

fn build_forest(roots: &[String], tasks: Vec<Task>, max_depth: usize, include_done: bool) -> Vec<TreeNode> {
    let mut by_id: HashMap<String, Task> = HashMap::with_capacity(tasks.len());
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for task in tasks {
        if let Some(parent) = &task.parent_id {
            children.entry(parent.clone()).or_default().push(task.id.clone());
        }
        by_id.insert(task.id.clone(), task);
    }
    for ids in children.values_mut() {
        ids.sort_by_key(|id| by_id.get(id).map(|t| t.path_order));
    }

    roots
        .iter()
        .filter_map(|id| node(id, 1, max_depth, include_done, &mut by_id, &children))
        .collect()
}

fn node(
    id: &str,
    depth: usize,
    max_depth: usize,
    include_done: bool,
    by_id: &mut HashMap<String, Task>,
    children: &HashMap<String, Vec<String>>,
) -> Option<TreeNode> {
    let task = by_id.remove(id)?;
    if !include_done && task.status.is_done() {
        return None;
    }
    let kids = if depth < max_depth {
        children
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|child| node(child, depth + 1, max_depth, include_done, by_id, children))
            .collect()
    } else {
        Vec::new()
    };
    Some(TreeNode { task, children: kids })
}

/// Project names are `[A-Za-z0-9_-]+`.
fn validate_project(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::invalid(
            "project",
            format!("'{name}' must match [A-Za-z0-9_-]+"),
        ))
    }
}

/// A data root holding any number of projects.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    config: StoreConfig,
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

impl Workspace {
    /// # Errors
    ///
    /// `ConfigParseError` if `<root>/config.toml` is invalid.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = load_config(&root)?;
        Ok(Self {
            root,
            config,
            stores: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The store for `project`, opened on first use.
    ///
    /// # Errors
    ///
    /// As [`Store::open_with`].
    pub fn store(&self, project: &str) -> Result<Arc<Store>> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(project) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(Store::open_with(&self.root, project, self.config.clone())?);
        stores.insert(project.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Create a task in `project`.
    ///
    /// # Errors
    ///
    /// As [`Workspace::store`] and [`Store::create`].
    pub fn create(&self, project: &str, new: NewTask) -> Result<Task> {
        self.store(project)?.create(new)
    }

    /// Names of the projects present on disk, sorted.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the projects directory cannot be listed.
    pub fn projects(&self) -> Result<Vec<String>> {
        let dir = self.root.join(PROJECTS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::storage("list projects", err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::storage("list projects", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().join(TASKS_DIR).is_dir() && validate_project(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
