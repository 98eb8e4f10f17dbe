//! E2E CLI tests for `st`.
//!
//! Each test runs the binary as a subprocess against an isolated data root.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn st(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("st"));
    cmd.env("STRATA_ROOT", root);
    cmd.env("STRATA_PROJECT", "px");
    cmd.env("STRATA_LOG", "error");
    cmd
}

fn json(root: &Path, args: &[&str]) -> Value {
    let output = st(root).args(args).arg("--json").output().expect("run st");
    assert!(
        output.status.success(),
        "st {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn create(root: &Path, title: &str, level: &str, parent: Option<&str>) -> String {
    let mut args = vec!["create", title, "--level", level];
    if let Some(parent) = parent {
        args.extend(["--parent", parent]);
    }
    json(root, &args)["id"]
        .as_str()
        .expect("id field")
        .to_string()
}

/// Project X > Phase 1 > Build API, returning the three ids.
fn chain(root: &Path) -> (String, String, String) {
    let ms = create(root, "Project X", "master", None);
    let ep = create(root, "Phase 1", "epic", Some(&ms));
    let tk = create(root, "Build API", "task", Some(&ep));
    (ms, ep, tk)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn create_assigns_paths_and_writes_documents() {
    let dir = TempDir::new().unwrap();
    let (ms, ep, tk) = chain(dir.path());

    let task = json(dir.path(), &["show", &tk]);
    assert_eq!(task["path"], "1.1.1");
    assert_eq!(task["status"], "todo");
    assert_eq!(task["parent_id"], ep.as_str());
    assert_eq!(json(dir.path(), &["show", &ep])["completion_percentage"], 0);

    let doc = dir.path().join("projects/px/tasks").join(format!("{ms}.md"));
    assert!(fs::read_to_string(doc).unwrap().contains("title: Project X"));
}

#[test]
fn tree_prints_the_hierarchy() {
    let dir = TempDir::new().unwrap();
    chain(dir.path());

    st(dir.path())
        .arg("tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("Project X"))
        .stdout(predicate::str::contains("1.1.1"))
        .stdout(predicate::str::contains("[todo] Build API"));

    let forest = json(dir.path(), &["tree", "--depth", "2"]);
    let roots = forest.as_array().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["children"][0]["task"]["path"], "1.1");
    assert!(roots[0]["children"][0]["children"].as_array().unwrap().is_empty());
}

#[test]
fn done_rolls_up_through_update() {
    let dir = TempDir::new().unwrap();
    let (ms, ep, tk) = chain(dir.path());

    let task = json(dir.path(), &["update", &tk, "--status", "done"]);
    assert_eq!(task["status"], "done");
    assert_eq!(json(dir.path(), &["show", &ep])["completion_percentage"], 100);
    let master = json(dir.path(), &["show", &ms]);
    assert_eq!(master["completion_percentage"], 100);
    assert_eq!(master["subtree"]["completed"], 2);
}

#[test]
fn invalid_move_reports_code_and_hint() {
    let dir = TempDir::new().unwrap();
    let (ms, ep, tk) = chain(dir.path());

    st(dir.path())
        .args(["move", &ep, "--parent", &tk])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[E2004]"))
        .stderr(predicate::str::contains("hint:"));

    let output = st(dir.path())
        .args(["move", &ms, "--parent", &ep, "--json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let err: Value = serde_json::from_slice(&output.stderr).expect("JSON error on stderr");
    assert_eq!(err["error"]["code"], "E2003");
}

#[test]
fn move_repaths_the_subtree() {
    let dir = TempDir::new().unwrap();
    let (ms, _ep, tk) = chain(dir.path());
    let ep2 = create(dir.path(), "Phase 2", "epic", Some(&ms));
    create(dir.path(), "Handler", "subtask", Some(&tk));

    let moved = json(dir.path(), &["move", &tk, "--parent", &ep2]);
    assert_eq!(moved["task"]["path"], "1.2.1");
    assert_eq!(moved["descendants"][0]["path"], "1.2.1.1");
}

#[test]
fn delete_cascades_and_removes_files() {
    let dir = TempDir::new().unwrap();
    let (ms, ep, tk) = chain(dir.path());

    let deleted = json(dir.path(), &["delete", &ep]);
    assert_eq!(deleted["deleted"].as_array().unwrap().len(), 2);

    let tasks = dir.path().join("projects/px/tasks");
    assert!(!tasks.join(format!("{tk}.md")).exists());
    assert!(tasks.join(format!("{ms}.md")).exists());

    st(dir.path())
        .args(["show", &tk])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[E2001]"));
}

#[test]
fn list_filters_by_level_and_status() {
    let dir = TempDir::new().unwrap();
    let (_ms, ep, tk) = chain(dir.path());
    create(dir.path(), "Write docs", "task", Some(&ep));
    json(dir.path(), &["update", &tk, "--status", "blocked"]);

    let blocked = json(dir.path(), &["list", "--level", "task", "--status", "blocked"]);
    let blocked = blocked.as_array().unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0]["id"], tk.as_str());

    let children = json(dir.path(), &["list", "--parent", &ep]);
    assert_eq!(children.as_array().unwrap().len(), 2);

    st(dir.path())
        .args(["list", "--status", "finished"])
        .assert()
        .failure();
}

#[test]
fn rebuild_recovers_a_deleted_index() {
    let dir = TempDir::new().unwrap();
    let (_ms, _ep, tk) = chain(dir.path());
    json(dir.path(), &["update", &tk, "--status", "in_progress"]);
    let before = paths(&json(dir.path(), &["list"]));

    for name in ["index.db", "index.db-wal", "index.db-shm"] {
        let _ = fs::remove_file(dir.path().join("projects/px").join(name));
    }
    let report = json(dir.path(), &["rebuild"]);
    assert_eq!(report["task_count"], 3);
    assert!(report["skipped"].as_array().unwrap().is_empty());
    assert_eq!(paths(&json(dir.path(), &["list"])), before);
}

fn paths(list: &Value) -> Vec<(String, String, String)> {
    list.as_array()
        .unwrap()
        .iter()
        .map(|t| {
            (
                t["id"].as_str().unwrap().to_string(),
                t["path"].as_str().unwrap().to_string(),
                t["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[test]
fn projects_are_isolated() {
    let dir = TempDir::new().unwrap();
    chain(dir.path());
    st(dir.path())
        .args(["--project", "py", "create", "Other", "--level", "master"])
        .assert()
        .success();

    let projects = json(dir.path(), &["projects"]);
    assert_eq!(projects, serde_json::json!(["px", "py"]));
    let py = json(dir.path(), &["--project", "py", "list"]);
    assert_eq!(py.as_array().unwrap().len(), 1);
    assert_eq!(py[0]["path"], "1");
}

#[test]
fn update_without_changes_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_ms, _ep, tk) = chain(dir.path());
    st(dir.path())
        .args(["update", &tk])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to update"));
}
