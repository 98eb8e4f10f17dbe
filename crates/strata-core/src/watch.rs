//! File watcher feeding hand edits into the writer queue.
//!
//! The `notify` callback stays lightweight: it filters events down to task
//! document paths and forwards them over a channel. A debounce thread
//! collects paths for a fixed window starting at the first event, then
//! enqueues one [`Command::Reconcile`] with the de-duplicated set.
//!
//! ```text
//! notify → filter → debounce window → Reconcile command → writer thread
//! ```

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::doc::DocStore;
use crate::error::{Result, StoreError};
use crate::sync::queue::Command;

/// Fixed-window event coalescer.
///
/// The window opens with the first path pushed and closes `window` later no
/// matter how many more paths arrive; a new window opens with the next push.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    first: Option<Instant>,
    paths: BTreeSet<PathBuf>,
}

impl Debouncer {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            first: None,
            paths: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.first.get_or_insert(now);
        self.paths.insert(path);
    }

    /// Time left in the open window, `None` when nothing is pending.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.first
            .map(|first| (first + self.window).saturating_duration_since(now))
    }

    /// Take the coalesced paths once the window has closed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        match self.remaining(now) {
            Some(left) if left.is_zero() => self.flush(),
            _ => None,
        }
    }

    /// Take whatever is pending regardless of the window.
    pub fn flush(&mut self) -> Option<Vec<PathBuf>> {
        self.first = None;
        if self.paths.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.paths).into_iter().collect())
    }
}

/// A running watcher. Dropping it stops watching and joins the debounce
/// thread after it forwards any pending paths.
pub struct WatchHandle {
    watcher: Option<RecommendedWatcher>,
    debounce: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("running", &self.debounce.is_some())
            .finish()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        // Dropping the watcher drops its sender, which ends the debounce loop.
        drop(self.watcher.take());
        if let Some(Err(_)) = self.debounce.take().map(JoinHandle::join) {
            tracing::warn!("debounce thread panicked");
        }
    }
}

/// Watch `docs` and send debounced reconcile commands to `commands`.
///
/// # Errors
///
/// `StorageUnavailable` if the watcher or its thread cannot be started.
pub(crate) fn spawn(
    project: &str,
    docs: DocStore,
    window: Duration,
    commands: Sender<Command>,
) -> Result<WatchHandle> {
    let (tx, rx) = mpsc::channel::<PathBuf>();
    let filter = docs.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| forward(res, &filter, &tx),
        Config::default(),
    )
    .map_err(watch_error)?;
    watcher
        .watch(docs.dir(), RecursiveMode::NonRecursive)
        .map_err(watch_error)?;

    let name = project.to_string();
    let debounce = thread::Builder::new()
        .name(format!("strata-watch-{project}"))
        .spawn(move || debounce_loop(&name, &rx, &commands, window))
        .map_err(|e| StoreError::storage("start debounce thread", e))?;

    tracing::debug!(
        project,
        dir = %docs.dir().display(),
        window_ms = window.as_millis(),
        "watching task documents"
    );
    Ok(WatchHandle {
        watcher: Some(watcher),
        debounce: Some(debounce),
    })
}

fn watch_error(err: notify::Error) -> StoreError {
    StoreError::storage("start file watcher", io::Error::other(err))
}

fn forward(res: notify::Result<Event>, docs: &DocStore, tx: &Sender<PathBuf>) {
    let event = match res {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "file watcher error");
            return;
        }
    };
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    tracing::trace!(kind = ?event.kind, paths = ?event.paths, "watcher event");
    for path in event.paths {
        if docs.id_for(&path).is_some() && tx.send(path).is_err() {
            return;
        }
    }
}

fn debounce_loop(project: &str, rx: &Receiver<PathBuf>, commands: &Sender<Command>, window: Duration) {
    let mut debouncer = Debouncer::new(window);
    loop {
        let received = match debouncer.remaining(Instant::now()) {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(left) => rx.recv_timeout(left),
        };
        match received {
            Ok(path) => debouncer.push(path, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(paths) = debouncer.flush() {
                    let _ = enqueue(project, commands, paths);
                }
                break;
            }
        }
        let closed = debouncer.poll(Instant::now());
        if closed.is_some_and(|paths| !enqueue(project, commands, paths)) {
            break;
        }
    }
    tracing::debug!(project, "watcher stopped");
}

fn enqueue(project: &str, commands: &Sender<Command>, paths: Vec<PathBuf>) -> bool {
    tracing::debug!(project, count = paths.len(), "debounce window closed");
    commands
        .send(Command::Reconcile { paths, reply: None })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);

    #[test]
    fn idle_debouncer_has_nothing_pending() {
        let mut d = Debouncer::new(WINDOW);
        let now = Instant::now();
        assert_eq!(d.remaining(now), None);
        assert_eq!(d.poll(now + WINDOW), None);
    }

    #[test]
    fn burst_is_coalesced_into_one_sorted_set() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(PathBuf::from("b.md"), t0);
        d.push(PathBuf::from("a.md"), t0 + Duration::from_millis(10));
        d.push(PathBuf::from("b.md"), t0 + Duration::from_millis(20));

        assert_eq!(d.poll(t0 + Duration::from_millis(100)), None);
        assert_eq!(
            d.poll(t0 + WINDOW),
            Some(vec![PathBuf::from("a.md"), PathBuf::from("b.md")])
        );
        assert_eq!(d.remaining(t0 + WINDOW), None);
    }

    #[test]
    fn window_is_fixed_from_the_first_event() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(PathBuf::from("a.md"), t0);
        d.push(PathBuf::from("a.md"), t0 + Duration::from_millis(200));
        assert_eq!(
            d.remaining(t0 + Duration::from_millis(200)),
            Some(Duration::from_millis(50))
        );
        assert!(d.poll(t0 + WINDOW).is_some());
    }

    #[test]
    fn next_push_opens_a_new_window() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(PathBuf::from("a.md"), t0);
        assert!(d.poll(t0 + WINDOW).is_some());

        let t1 = t0 + Duration::from_secs(5);
        d.push(PathBuf::from("c.md"), t1);
        assert_eq!(d.remaining(t1), Some(WINDOW));
    }

    #[test]
    fn flush_ignores_the_window() {
        let mut d = Debouncer::new(WINDOW);
        d.push(PathBuf::from("a.md"), Instant::now());
        assert_eq!(d.flush(), Some(vec![PathBuf::from("a.md")]));
        assert_eq!(d.flush(), None);
    }
}
