//! Watcher-driven reconciliation.
//!
//! These tests touch real files and wait on the platform watcher, so every
//! check polls with a generous deadline instead of sleeping a fixed time.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use strata_core::config::StoreConfig;
use strata_core::lock::ProjectLock;
use strata_core::sync::LOCK_FILE;
use strata_core::{Level, NewTask, Priority, Status, Store, StoreError};

const DEADLINE: Duration = Duration::from_secs(10);

fn open(dir: &std::path::Path) -> Store {
    let mut config = StoreConfig::default();
    config.sync.debounce_ms = 50;
    Store::open_with(dir, "px", config).expect("open store")
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    check()
}

#[test]
fn burst_of_saves_lands_as_the_last_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let _watch = store.watch().unwrap();

    let file = store.tasks_dir().join(format!("{}.md", ms.id));
    let original = fs::read_to_string(&file).unwrap();
    for priority in ["low", "high", "urgent"] {
        fs::write(&file, original.replace("priority: medium", &format!("priority: {priority}"))).unwrap();
    }

    assert!(eventually(|| {
        store
            .get(&ms.id)
            .is_ok_and(|t| t.priority == Priority::Urgent)
    }));
}

#[test]
fn deleting_a_file_by_hand_unindexes_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let ep = store
        .create(NewTask::new(Level::Epic, "Phase 1").under(&ms.id))
        .unwrap();
    let _watch = store.watch().unwrap();

    fs::remove_file(store.tasks_dir().join(format!("{}.md", ep.id))).unwrap();
    assert!(eventually(|| matches!(
        store.get(&ep.id),
        Err(StoreError::TaskNotFound(_))
    )));
}

#[test]
fn api_writes_while_watching_stay_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let _watch = store.watch().unwrap();

    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let ep = store
        .create(NewTask::new(Level::Epic, "Phase 1").under(&ms.id))
        .unwrap();
    store
        .update(&ep.id, strata_core::TaskChanges::status(Status::Done))
        .unwrap();

    // Give the watcher time to replay our own writes; they must be no-ops.
    thread::sleep(Duration::from_millis(300));
    let master = store.get(&ms.id).unwrap();
    assert_eq!(master.status, Status::Done);
    assert!(
        master
            .activity_log
            .iter()
            .all(|e| e.action != "external_edit" && e.action != "conflict")
    );
    assert!(store.rebuild().unwrap().skipped.is_empty());
}

#[test]
fn stopping_the_watcher_stops_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    drop(store.watch().unwrap());

    let file = store.tasks_dir().join(format!("{}.md", ms.id));
    let text = fs::read_to_string(&file).unwrap();
    fs::write(&file, text.replace("status: todo", "status: blocked")).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(store.get(&ms.id).unwrap().status, Status::Todo);

    store.reconcile(vec![file]).unwrap();
    assert_eq!(store.get(&ms.id).unwrap().status, Status::Blocked);
}

#[test]
fn edit_made_while_the_lock_is_held_lands_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::default();
    config.sync.debounce_ms = 50;
    config.sync.lock_timeout_ms = 100;
    let store = Store::open_with(dir.path(), "px", config).unwrap();
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let _watch = store.watch().unwrap();

    let lock = store.tasks_dir().parent().unwrap().join(LOCK_FILE);
    let held = ProjectLock::acquire(&lock, Duration::from_secs(1)).unwrap();
    let file = store.tasks_dir().join(format!("{}.md", ms.id));
    let text = fs::read_to_string(&file).unwrap();
    fs::write(&file, text.replace("status: todo", "status: blocked")).unwrap();

    // Long enough for the debounced reconcile to time out on the lock.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(store.get(&ms.id).unwrap().status, Status::Todo);
    drop(held);

    assert!(eventually(|| {
        store
            .get(&ms.id)
            .is_ok_and(|t| t.status == Status::Blocked)
    }));
}
