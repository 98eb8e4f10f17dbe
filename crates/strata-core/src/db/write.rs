//! Document → SQLite index write path.
//!
//! Rows are only ever written after the documents they mirror have been
//! published, so everything here is replayable from the task files.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::schema::DATA_TABLES;
use crate::model::Task;
use crate::path::{depth, sort_key};

/// Row changes produced by one mutation, applied in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    /// Tasks to insert or replace, with the hash of the document just written.
    pub upserts: Vec<(Task, String)>,
    /// Task ids whose rows are dropped.
    pub deletes: Vec<String>,
}

impl IndexBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Applies [`IndexBatch`]es to the index.
pub struct IndexWriter<'conn> {
    conn: &'conn Connection,
}

impl<'conn> IndexWriter<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Apply a batch all-or-nothing.
    ///
    /// Deletes run first so that a path freed by a removed task can be taken
    /// by an upsert in the same batch.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled
    /// back and the index is left as it was.
    pub fn apply(&self, batch: &IndexBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin index transaction")?;

        match self.apply_inner(batch) {
            Ok(()) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("commit index transaction")?;
                Ok(())
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    fn apply_inner(&self, batch: &IndexBatch) -> Result<()> {
        for id in &batch.deletes {
            delete_task(self.conn, id)?;
        }
        for (task, hash) in &batch.upserts {
            upsert_task(self.conn, task, hash)?;
        }
        Ok(())
    }
}

/// Insert or replace one task row together with its side-table rows.
///
/// # Errors
///
/// Returns an error if serialization or any statement fails.
pub fn upsert_task(conn: &Connection, task: &Task, content_hash: &str) -> Result<()> {
    let checklist_json =
        serde_json::to_string(&task.checklist).context("serialize checklist")?;
    let metadata_json = serde_json::to_string(&task.metadata).context("serialize metadata")?;
    let depth = i64::try_from(depth(&task.path)).unwrap_or(i64::MAX);

    conn.execute(
        "INSERT INTO tasks (
            task_id, project, level, parent_id, path, path_sort_key, path_order, depth,
            title, description, status, priority, estimated_hours, actual_hours,
            completion_percentage, checklist_json, metadata_json, content_hash,
            created_at_us, updated_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        ON CONFLICT(task_id) DO UPDATE SET
            project = excluded.project,
            level = excluded.level,
            parent_id = excluded.parent_id,
            path = excluded.path,
            path_sort_key = excluded.path_sort_key,
            path_order = excluded.path_order,
            depth = excluded.depth,
            title = excluded.title,
            description = excluded.description,
            status = excluded.status,
            priority = excluded.priority,
            estimated_hours = excluded.estimated_hours,
            actual_hours = excluded.actual_hours,
            completion_percentage = excluded.completion_percentage,
            checklist_json = excluded.checklist_json,
            metadata_json = excluded.metadata_json,
            content_hash = excluded.content_hash,
            created_at_us = excluded.created_at_us,
            updated_at_us = excluded.updated_at_us",
        params![
            task.id,
            task.project,
            task.level.as_str(),
            task.parent_id,
            task.path,
            sort_key(&task.path),
            task.path_order,
            depth,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority.as_str(),
            task.estimated_hours,
            task.actual_hours,
            task.completion_percentage,
            checklist_json,
            metadata_json,
            content_hash,
            task.created_at.timestamp_micros(),
            task.updated_at.timestamp_micros(),
        ],
    )
    .with_context(|| format!("upsert task '{}'", task.id))?;

    for table in ["task_tags", "task_dependencies", "task_activity"] {
        conn.execute(&format!("DELETE FROM {table} WHERE task_id = ?1"), params![task.id])
            .with_context(|| format!("clear {table} for '{}'", task.id))?;
    }

    for tag in &task.tags {
        conn.execute(
            "INSERT INTO task_tags (task_id, tag) VALUES (?1, ?2)",
            params![task.id, tag],
        )
        .with_context(|| format!("insert tag '{tag}' for '{}'", task.id))?;
    }

    for dep in &task.dependencies {
        conn.execute(
            "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
            params![task.id, dep],
        )
        .with_context(|| format!("insert dependency '{dep}' for '{}'", task.id))?;
    }

    for (seq, entry) in task.activity_log.iter().enumerate() {
        conn.execute(
            "INSERT INTO task_activity (task_id, seq, action, detail, at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                i64::try_from(seq).unwrap_or(i64::MAX),
                entry.action,
                entry.detail,
                entry.at.timestamp_micros(),
            ],
        )
        .with_context(|| format!("insert activity for '{}'", task.id))?;
    }

    Ok(())
}

/// Drop one task row; side tables follow through `ON DELETE CASCADE`.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn delete_task(conn: &Connection, task_id: &str) -> Result<()> {
    conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])
        .with_context(|| format!("delete task '{task_id}'"))?;
    Ok(())
}

/// Delete all rows from every data table, keeping the schema.
///
/// # Errors
///
/// Returns an error if any delete fails.
pub fn clear_index(conn: &Connection) -> Result<()> {
    for table in DATA_TABLES {
        conn.execute(&format!("DELETE FROM {table}"), [])
            .with_context(|| format!("clear {table}"))?;
    }
    Ok(())
}

/// Stamp `index_meta` after a full rebuild.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn record_rebuild(conn: &Connection, document_count: usize, at_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE index_meta SET last_rebuild_at_us = ?1, document_count = ?2 WHERE id = 1",
        params![at_us, i64::try_from(document_count).unwrap_or(i64::MAX)],
    )
    .context("update index_meta")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::migrate;
    use crate::db::query;
    use crate::model::{ChecklistItem, Level, Priority, Status, now};
    use std::collections::{BTreeMap, BTreeSet};

    fn test_db() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        conn.pragma_update(None, "foreign_keys", "ON").expect("fk on");
        migrate(&mut conn).expect("migrate");
        conn
    }

    fn master(id: &str, path: &str) -> Task {
        let ts = now();
        Task {
            id: id.into(),
            level: Level::Master,
            parent_id: None,
            path: path.into(),
            path_order: path.parse().unwrap_or(1),
            project: "px".into(),
            title: "Project X".into(),
            description: "Objective: ship".into(),
            status: Status::Todo,
            priority: Priority::High,
            tags: BTreeSet::from(["q3".to_string()]),
            estimated_hours: Some(12.5),
            actual_hours: None,
            completion_percentage: 0,
            dependencies: BTreeSet::from(["ms-other".to_string()]),
            checklist: vec![ChecklistItem::new("kickoff", true)],
            metadata: BTreeMap::from([("owner".to_string(), serde_json::json!("ana"))]),
            created_at: ts,
            updated_at: ts,
            activity_log: Vec::new(),
        }
    }

    #[test]
    fn upsert_round_trips_all_columns() {
        let conn = test_db();
        let mut task = master("ms-1", "1");
        task.record("created", "level=master", now());
        upsert_task(&conn, &task, "h1").unwrap();

        let loaded = query::get_task(&conn, "ms-1").unwrap().unwrap();
        assert_eq!(loaded, task);
        assert_eq!(query::content_hash(&conn, "ms-1").unwrap().as_deref(), Some("h1"));
    }

    #[test]
    fn upsert_replaces_side_tables() {
        let conn = test_db();
        let mut task = master("ms-1", "1");
        upsert_task(&conn, &task, "h1").unwrap();

        task.tags = BTreeSet::from(["q4".to_string()]);
        task.title = "Renamed".into();
        upsert_task(&conn, &task, "h2").unwrap();

        let loaded = query::get_task(&conn, "ms-1").unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.tags, BTreeSet::from(["q4".to_string()]));
    }

    #[test]
    fn batch_deletes_before_upserting() {
        let conn = test_db();
        upsert_task(&conn, &master("ms-1", "1"), "h").unwrap();

        let batch = IndexBatch {
            upserts: vec![(master("ms-2", "1"), "h".into())],
            deletes: vec!["ms-1".into()],
        };
        IndexWriter::new(&conn).apply(&batch).unwrap();

        assert!(query::get_task(&conn, "ms-1").unwrap().is_none());
        assert_eq!(query::get_task(&conn, "ms-2").unwrap().unwrap().path, "1");
        let orphan_tags: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM task_tags WHERE task_id = 'ms-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphan_tags, 0);
    }

    #[test]
    fn failed_batch_rolls_back() {
        let conn = test_db();
        upsert_task(&conn, &master("ms-1", "1"), "h").unwrap();

        let batch = IndexBatch {
            upserts: vec![(master("ms-2", "2"), "h".into()), (master("ms-3", "2"), "h".into())],
            deletes: Vec::new(),
        };
        assert!(IndexWriter::new(&conn).apply(&batch).is_err());
        assert!(query::get_task(&conn, "ms-2").unwrap().is_none());
        assert_eq!(query::task_count(&conn).unwrap(), 1);
    }

    #[test]
    fn clear_and_stamp_rebuild() {
        let conn = test_db();
        upsert_task(&conn, &master("ms-1", "1"), "h").unwrap();
        clear_index(&conn).unwrap();
        record_rebuild(&conn, 7, 42).unwrap();

        assert_eq!(query::task_count(&conn).unwrap(), 0);
        let meta = query::index_meta(&conn).unwrap();
        assert_eq!(meta.document_count, 7);
        assert_eq!(meta.last_rebuild_at_us, 42);
    }
}
