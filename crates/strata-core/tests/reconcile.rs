//! Folding hand edits back into the index through `Store::reconcile`.

use std::fs;
use std::path::PathBuf;

use strata_core::{Level, NewTask, Priority, Status, Store, StoreError, Task, TaskChanges};
use tempfile::TempDir;

fn setup() -> (TempDir, Store, Task, Task) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Store::open(dir.path(), "px").expect("open store");
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let ep = store
        .create(NewTask::new(Level::Epic, "Phase 1").under(&ms.id))
        .unwrap();
    (dir, store, ms, ep)
}

fn file(store: &Store, id: &str) -> PathBuf {
    store.tasks_dir().join(format!("{id}.md"))
}

fn edit(store: &Store, id: &str, from: &str, to: &str) -> PathBuf {
    let path = file(store, id);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains(from), "document lacks '{from}'");
    fs::write(&path, text.replacen(from, to, 1)).unwrap();
    path
}

#[test]
fn replaying_the_same_event_is_a_noop() {
    let (_dir, store, _ms, ep) = setup();
    let path = edit(&store, &ep.id, "priority: medium", "priority: high");

    let first = store.reconcile(vec![path.clone()]).unwrap();
    assert_eq!(first.applied, vec![ep.id.clone()]);
    let after_first = store.get(&ep.id).unwrap();
    assert_eq!(after_first.priority, Priority::High);

    let second = store.reconcile(vec![path.clone(), path]).unwrap();
    assert!(second.is_noop());
    assert_eq!(second.unchanged, 1);
    assert_eq!(store.get(&ep.id).unwrap(), after_first);
}

#[test]
fn hand_edited_status_rolls_up() {
    let (_dir, store, ms, ep) = setup();
    let path = edit(&store, &ep.id, "status: todo", "status: done");
    store.reconcile(vec![path]).unwrap();

    let master = store.get(&ms.id).unwrap();
    assert_eq!(master.completion_percentage, 100);
    assert_eq!(master.status, Status::Done);
}

#[test]
fn newer_index_wins_and_keeps_the_edit_aside() {
    let (_dir, store, _ms, ep) = setup();
    let stale = fs::read_to_string(file(&store, &ep.id)).unwrap();
    store
        .update(&ep.id, TaskChanges::status(Status::InProgress))
        .unwrap();

    // An editor saves a buffer opened before the API update.
    fs::write(file(&store, &ep.id), stale.replace("title: Phase 1", "title: Phase One")).unwrap();
    let report = store.reconcile(vec![file(&store, &ep.id)]).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let backup = fs::read_to_string(&report.conflicts[0]).unwrap();
    assert!(backup.contains("title: Phase One"));

    let task = store.get(&ep.id).unwrap();
    assert_eq!(task.title, "Phase 1");
    assert_eq!(task.status, Status::InProgress);
    assert_eq!(task.activity_log.last().unwrap().action, "conflict");
    let on_disk = fs::read_to_string(file(&store, &ep.id)).unwrap();
    assert!(on_disk.contains("status: in_progress"));
}

#[test]
fn api_write_over_an_unreconciled_edit_keeps_a_backup() {
    let (_dir, store, _ms, ep) = setup();
    edit(&store, &ep.id, "title: Phase 1", "title: Edited by hand");
    let task = store
        .update(&ep.id, TaskChanges::status(Status::Blocked))
        .unwrap();

    assert_eq!(task.status, Status::Blocked);
    assert!(task.activity_log.iter().any(|e| e.action == "conflict"));
    let backups: Vec<_> = fs::read_dir(store.tasks_dir())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&format!("{}.md.conflict-", ep.id)))
        .collect();
    assert_eq!(backups.len(), 1);
}

#[test]
fn removed_document_drops_the_task() {
    let (_dir, store, ms, ep) = setup();
    let path = file(&store, &ep.id);
    fs::remove_file(&path).unwrap();

    let report = store.reconcile(vec![path]).unwrap();
    assert_eq!(report.removed, vec![ep.id.clone()]);
    assert!(matches!(store.get(&ep.id), Err(StoreError::TaskNotFound(_))));
    assert!(store.children(&ms.id).unwrap().is_empty());
}

#[test]
fn malformed_document_is_excluded_until_fixed() {
    let (_dir, store, _ms, ep) = setup();
    let path = file(&store, &ep.id);
    let good = fs::read_to_string(&path).unwrap();
    fs::write(&path, "no front matter here\n").unwrap();

    let report = store.reconcile(vec![path.clone()]).unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert!(store.get(&ep.id).is_err());
    assert!(path.exists(), "malformed documents are never deleted");

    fs::write(&path, good).unwrap();
    let report = store.reconcile(vec![path]).unwrap();
    assert_eq!(report.applied, vec![ep.id.clone()]);
    assert_eq!(store.get(&ep.id).unwrap().title, "Phase 1");
}

#[test]
fn level_change_is_quarantined() {
    let (_dir, store, _ms, ep) = setup();
    let path = edit(&store, &ep.id, "level: epic", "level: task");
    let report = store.reconcile(vec![path.clone()]).unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(store.get(&ep.id).unwrap().level, Level::Epic);
    assert!(fs::read_to_string(path).unwrap().contains("level: epic"));
}

#[test]
fn new_document_is_adopted() {
    let (_dir, store, ms, ep) = setup();
    let id = "ep-00000000aa";
    let text = fs::read_to_string(file(&store, &ep.id))
        .unwrap()
        .replace(&ep.id, id)
        .replace("title: Phase 1", "title: Phase 2")
        .replace("path_order: 1", "path_order: 2");
    let path = file(&store, id);
    fs::write(&path, text).unwrap();

    let report = store.reconcile(vec![path]).unwrap();
    assert_eq!(report.applied, vec![id.to_string()]);
    let adopted = store.get(id).unwrap();
    assert_eq!(adopted.path, "1.2");
    assert_eq!(adopted.parent_id.as_deref(), Some(ms.id.as_str()));
    assert_eq!(store.children(&ms.id).unwrap().len(), 2);
}

#[test]
fn reconcile_all_picks_up_every_document() {
    let (_dir, store, _ms, ep) = setup();
    edit(&store, &ep.id, "priority: medium", "priority: low");
    let report = store.reconcile_all().unwrap();
    assert_eq!(report.applied, vec![ep.id.clone()]);
    assert_eq!(report.unchanged, 1);
}
