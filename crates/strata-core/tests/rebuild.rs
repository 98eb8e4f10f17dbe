//! Rebuilding the index from documents, on demand and at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use strata_core::{Level, NewTask, Status, Store, TaskChanges, TreeRoot};

fn fingerprint(store: &Store) -> BTreeMap<String, (String, Status, u8)> {
    store
        .get_tree(&TreeRoot::Project, None, true)
        .unwrap()
        .iter()
        .flat_map(|root| {
            root.walk()
                .map(|t| (t.id.clone(), (t.path.clone(), t.status, t.completion_percentage)))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn populate(store: &Store) {
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
    let ep = store
        .create(NewTask::new(Level::Epic, "Phase 1").under(&ms.id))
        .unwrap();
    let api = store
        .create(NewTask::new(Level::Task, "Build API").under(&ep.id))
        .unwrap();
    store
        .create(NewTask::new(Level::Task, "Write docs").under(&ep.id))
        .unwrap();
    store
        .create(NewTask::new(Level::Subtask, "Handler").under(&api.id))
        .unwrap();
    store
        .update(&api.id, TaskChanges::status(Status::Done))
        .unwrap();
    store.create(NewTask::new(Level::Master, "Project Y")).unwrap();
}

fn remove_index(project_dir: &Path) {
    for name in ["index.db", "index.db-wal", "index.db-shm"] {
        let _ = fs::remove_file(project_dir.join(name));
    }
}

#[test]
fn deleted_index_is_rebuilt_to_the_same_forest() {
    let dir = tempfile::tempdir().unwrap();
    let before = {
        let store = Store::open(dir.path(), "px").unwrap();
        populate(&store);
        fingerprint(&store)
    };
    remove_index(&dir.path().join("projects/px"));

    let store = Store::open(dir.path(), "px").unwrap();
    let rebuilt = store.recovery().rebuilt.as_ref().expect("startup rebuild");
    assert_eq!(rebuilt.task_count, 6);
    assert_eq!(fingerprint(&store), before);
}

#[test]
fn explicit_rebuild_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), "px").unwrap();
    populate(&store);
    let before = fingerprint(&store);

    let report = store.rebuild().unwrap();
    assert_eq!(report.document_count, 6);
    assert_eq!(report.task_count, 6);
    assert!(report.skipped.is_empty());
    assert!(report.repathed.is_empty());
    assert_eq!(report.refreshed, 0);
    assert_eq!(fingerprint(&store), before);
}

#[test]
fn corrupt_index_is_quarantined_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("projects/px");
    let before = {
        let store = Store::open(dir.path(), "px").unwrap();
        populate(&store);
        fingerprint(&store)
    };
    remove_index(&project);
    fs::write(project.join("index.db"), b"definitely not sqlite".repeat(256)).unwrap();

    let store = Store::open(dir.path(), "px").unwrap();
    assert!(store.recovery().quarantined.is_some());
    assert!(project.join("index.db.corrupt").exists());
    assert_eq!(fingerprint(&store), before);
}

#[test]
fn malformed_and_copied_documents_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), "px").unwrap();
    let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();

    let tasks = store.tasks_dir().to_path_buf();
    fs::write(tasks.join("ms-00000000ff.md"), "---\nid: [unclosed\n").unwrap();
    fs::copy(tasks.join(format!("{}.md", ms.id)), tasks.join("ms-00000000ee.md")).unwrap();

    let report = store.rebuild().unwrap();
    assert_eq!(report.document_count, 3);
    assert_eq!(report.task_count, 1);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(store.get(&ms.id).unwrap().title, "Project X");
}

#[test]
fn edits_made_while_closed_are_indexed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let (id, file) = {
        let store = Store::open(dir.path(), "px").unwrap();
        let ms = store.create(NewTask::new(Level::Master, "Project X")).unwrap();
        let file = store.tasks_dir().join(format!("{}.md", ms.id));
        (ms.id, file)
    };
    let text = fs::read_to_string(&file).unwrap();
    fs::write(&file, text.replace("title: Project X", "title: Project Z")).unwrap();

    let store = Store::open(dir.path(), "px").unwrap();
    assert!(store.recovery().rebuilt.is_some());
    assert_eq!(store.get(&id).unwrap().title, "Project Z");
}
