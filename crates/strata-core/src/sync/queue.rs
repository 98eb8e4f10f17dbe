//! Single-writer command queue.
//!
//! Every mutation of a project, whether it comes from the API or from the
//! watcher, is a [`Command`] processed in arrival order by one thread that
//! owns the [`Engine`].

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::engine::{Engine, Moved};
use super::reconcile::ReconcileReport;
use crate::db::rebuild::RebuildReport;
use crate::error::{Result, StoreError};
use crate::model::{NewTask, Task, TaskChanges};

pub(crate) type Reply<T> = SyncSender<Result<T>>;

pub(crate) enum Command {
    Create {
        task: NewTask,
        reply: Reply<Task>,
    },
    Move {
        task_id: String,
        parent_id: Option<String>,
        reply: Reply<Moved>,
    },
    Update {
        task_id: String,
        changes: TaskChanges,
        reply: Reply<Task>,
    },
    Delete {
        task_id: String,
        reply: Reply<Vec<String>>,
    },
    /// `reply` is `None` for watcher-driven reconciliation.
    Reconcile {
        paths: Vec<PathBuf>,
        reply: Option<Reply<ReconcileReport>>,
    },
    Rebuild {
        reply: Reply<RebuildReport>,
    },
    Shutdown,
}

pub(crate) fn spawn_writer(engine: Engine, commands: Receiver<Command>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("strata-writer-{}", engine.project()))
        .spawn(move || run(&engine, &commands))
}

/// Delay before the first retry of a failed watcher reconcile; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Watcher reconciles that still fail after this many retries are dropped.
const MAX_RETRIES: u32 = 6;

/// Paths from a watcher reconcile that hit a transient error.
#[derive(Debug)]
struct Retry {
    paths: BTreeSet<PathBuf>,
    attempt: u32,
    due: Instant,
}

impl Retry {
    fn first(paths: Vec<PathBuf>, now: Instant) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            attempt: 1,
            due: now + RETRY_BASE,
        }
    }

    fn backoff(self, now: Instant) -> Option<Self> {
        (self.attempt < MAX_RETRIES).then(|| Self {
            due: now + RETRY_BASE * 2_u32.pow(self.attempt),
            attempt: self.attempt + 1,
            paths: self.paths,
        })
    }
}

fn run(engine: &Engine, commands: &Receiver<Command>) {
    tracing::debug!(project = %engine.project(), "writer started");
    let mut retry: Option<Retry> = None;
    loop {
        let received = match retry.as_ref() {
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(pending) => {
                commands.recv_timeout(pending.due.saturating_duration_since(Instant::now()))
            }
        };
        match received {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(command) => handle(engine, command, &mut retry),
            Err(RecvTimeoutError::Timeout) => {
                retry = retry.and_then(|pending| retry_reconcile(engine, pending));
            }
        }
    }
    tracing::debug!(project = %engine.project(), "writer stopped");
}

fn handle(engine: &Engine, command: Command, retry: &mut Option<Retry>) {
    match command {
        Command::Create { task, reply } => {
            let _ = reply.send(engine.create(task));
        }
        Command::Move {
            task_id,
            parent_id,
            reply,
        } => {
            let _ = reply.send(engine.move_task(&task_id, parent_id.as_deref()));
        }
        Command::Update {
            task_id,
            changes,
            reply,
        } => {
            let _ = reply.send(engine.update(&task_id, &changes));
        }
        Command::Delete { task_id, reply } => {
            let _ = reply.send(engine.delete(&task_id));
        }
        Command::Reconcile {
            paths,
            reply: Some(reply),
        } => {
            let _ = reply.send(engine.reconcile(paths));
        }
        Command::Reconcile { paths, reply: None } => {
            let Err(err) = engine.reconcile(paths.clone()) else {
                return;
            };
            if !err.is_transient() {
                log_dropped(engine, &err, 0);
                return;
            }
            tracing::debug!(
                project = %engine.project(),
                error = %err,
                count = paths.len(),
                "watcher reconciliation deferred"
            );
            match retry.as_mut() {
                Some(pending) => pending.paths.extend(paths),
                None => *retry = Some(Retry::first(paths, Instant::now())),
            }
        }
        Command::Rebuild { reply } => {
            let _ = reply.send(engine.rebuild());
        }
        Command::Shutdown => {}
    }
}

fn retry_reconcile(engine: &Engine, pending: Retry) -> Option<Retry> {
    let paths: Vec<PathBuf> = pending.paths.iter().cloned().collect();
    let err = engine.reconcile(paths).err()?;
    if !err.is_transient() {
        log_dropped(engine, &err, pending.attempt);
        return None;
    }
    let attempt = pending.attempt;
    let next = pending.backoff(Instant::now());
    if next.is_none() {
        log_dropped(engine, &err, attempt);
    }
    next
}

fn log_dropped(engine: &Engine, err: &StoreError, retries: u32) {
    tracing::warn!(
        project = %engine.project(),
        error = %err,
        code = %err.code(),
        retries,
        "watcher reconciliation failed; paths dropped until they change again"
    );
}
