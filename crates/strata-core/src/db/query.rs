//! SQLite query helpers for the task index.
//!
//! All functions take a shared `&Connection` and return `anyhow::Result<T>`
//! with fully hydrated [`Task`] values (never raw rows).

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Params, params, params_from_iter};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::str::FromStr;

use crate::model::{ActivityEntry, ChecklistItem, Level, Status, Task, from_micros};

const TASK_COLUMNS: &str = "t.task_id, t.level, t.parent_id, t.path, t.path_order, t.project, \
     t.title, t.description, t.status, t.priority, t.estimated_hours, t.actual_hours, \
     t.completion_percentage, t.checklist_json, t.metadata_json, t.created_at_us, t.updated_at_us";

/// Filter criteria for task listings.
///
/// All fields are optional and combined with AND semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub level: Option<Level>,
    pub status: Option<Status>,
    /// Task must carry this tag.
    pub tag: Option<String>,
    /// Only direct children of this task.
    pub parent_id: Option<String>,
    pub limit: Option<u32>,
}

/// Aggregate counts below a subtree root (the root itself excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubtreeCounts {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
}

/// Bookkeeping row of `index_meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    pub schema_version: u32,
    pub last_rebuild_at_us: i64,
    pub document_count: usize,
}

/// Fetch a single task by id.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.task_id = ?1");
    let mut stmt = conn.prepare(&sql).context("prepare get_task query")?;
    let task = stmt
        .query_row(params![task_id], row_to_task)
        .optional()
        .with_context(|| format!("get_task for '{task_id}'"))?;

    match task {
        Some(mut task) => {
            hydrate(conn, &mut task)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

/// Direct children of `parent_id` in sibling order; `None` lists the roots.
pub fn get_children(conn: &Connection, parent_id: Option<&str>) -> Result<Vec<Task>> {
    match parent_id {
        Some(parent) => {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.parent_id = ?1 ORDER BY t.path_order"
            );
            collect_tasks(conn, &sql, params![parent])
        }
        None => {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.parent_id IS NULL ORDER BY t.path_order"
            );
            collect_tasks(conn, &sql, [])
        }
    }
}

/// The task and every descendant, ordered by path. Empty if the task is unknown.
pub fn get_subtree(conn: &Connection, task_id: &str) -> Result<Vec<Task>> {
    let root: Option<(String, String)> = conn
        .query_row(
            "SELECT project, path FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("locate subtree root")?;

    let Some((project, path)) = root else {
        return Ok(Vec::new());
    };

    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks t \
         WHERE t.project = ?1 AND (t.path = ?2 OR t.path LIKE ?2 || '.%') \
         ORDER BY t.path_sort_key"
    );
    collect_tasks(conn, &sql, params![project, path])
}

/// Every indexed task in path order.
pub fn all_tasks(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t ORDER BY t.project, t.path_sort_key");
    collect_tasks(conn, &sql, [])
}

/// List tasks of `project` matching `filter`, in path order.
pub fn list_tasks(conn: &Connection, project: &str, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut param_values: Vec<String> = vec![project.to_string()];
    let mut conditions = vec!["t.project = ?1".to_string()];
    let mut joins = String::new();

    if let Some(level) = filter.level {
        param_values.push(level.as_str().to_string());
        conditions.push(format!("t.level = ?{}", param_values.len()));
    }

    if let Some(status) = filter.status {
        param_values.push(status.as_str().to_string());
        conditions.push(format!("t.status = ?{}", param_values.len()));
    }

    if let Some(ref parent_id) = filter.parent_id {
        param_values.push(parent_id.clone());
        conditions.push(format!("t.parent_id = ?{}", param_values.len()));
    }

    if let Some(ref tag) = filter.tag {
        param_values.push(tag.clone());
        let _ = write!(
            joins,
            " INNER JOIN task_tags tt ON tt.task_id = t.task_id AND tt.tag = ?{}",
            param_values.len()
        );
    }

    let limit_clause = filter
        .limit
        .map_or_else(String::new, |limit| format!(" LIMIT {limit}"));

    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks t{joins} WHERE {} ORDER BY t.path_sort_key{limit_clause}",
        conditions.join(" AND ")
    );

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("prepare list_tasks query: {sql}"))?;
    let rows = stmt
        .query_map(params_from_iter(param_values.iter()), row_to_task)
        .context("execute list_tasks query")?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("read list_tasks row")?);
    }
    for task in &mut tasks {
        hydrate(conn, task)?;
    }
    Ok(tasks)
}

/// Count the descendants of `task_id` by status.
pub fn subtree_counts(conn: &Connection, task_id: &str) -> Result<SubtreeCounts> {
    let mut counts = SubtreeCounts::default();
    for task in get_subtree(conn, task_id)?.into_iter().filter(|t| t.id != task_id) {
        counts.total += 1;
        match task.status {
            Status::Done => counts.completed += 1,
            Status::InProgress => counts.in_progress += 1,
            Status::Todo | Status::Blocked => {}
        }
    }
    Ok(counts)
}

/// Stored content hash of one task's document.
pub fn content_hash(conn: &Connection, task_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT content_hash FROM tasks WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("content_hash for '{task_id}'"))
}

/// Stored content hash of every indexed document, keyed by task id.
pub fn content_hashes(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT task_id, content_hash FROM tasks")
        .context("prepare content_hashes query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("execute content_hashes query")?;

    let mut out = HashMap::new();
    for row in rows {
        let (id, hash): (String, String) = row.context("read content_hashes row")?;
        out.insert(id, hash);
    }
    Ok(out)
}

pub fn task_count(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
        .context("count tasks")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

pub fn index_meta(conn: &Connection) -> Result<IndexMeta> {
    conn.query_row(
        "SELECT schema_version, last_rebuild_at_us, document_count FROM index_meta WHERE id = 1",
        [],
        |row| {
            Ok(IndexMeta {
                schema_version: row.get(0)?,
                last_rebuild_at_us: row.get(1)?,
                document_count: row.get::<_, i64>(2).map(|n| usize::try_from(n).unwrap_or(0))?,
            })
        },
    )
    .context("read index_meta")
}

fn collect_tasks<P: Params>(conn: &Connection, sql: &str, args: P) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("prepare task query: {sql}"))?;
    let rows = stmt
        .query_map(args, row_to_task)
        .context("execute task query")?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("read task row")?);
    }
    for task in &mut tasks {
        hydrate(conn, task)?;
    }
    Ok(tasks)
}

/// Load the multi-valued fields kept in side tables.
fn hydrate(conn: &Connection, task: &mut Task) -> Result<()> {
    let mut stmt = conn
        .prepare_cached("SELECT tag FROM task_tags WHERE task_id = ?1")
        .context("prepare tags query")?;
    task.tags = stmt
        .query_map(params![task.id], |row| row.get(0))
        .context("query tags")?
        .collect::<rusqlite::Result<BTreeSet<String>>>()
        .context("read tags")?;

    let mut stmt = conn
        .prepare_cached("SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1")
        .context("prepare dependencies query")?;
    task.dependencies = stmt
        .query_map(params![task.id], |row| row.get(0))
        .context("query dependencies")?
        .collect::<rusqlite::Result<BTreeSet<String>>>()
        .context("read dependencies")?;

    let mut stmt = conn
        .prepare_cached(
            "SELECT action, at_us, detail FROM task_activity WHERE task_id = ?1 ORDER BY seq",
        )
        .context("prepare activity query")?;
    task.activity_log = stmt
        .query_map(params![task.id], |row| {
            Ok(ActivityEntry {
                action: row.get(0)?,
                at: from_micros(row.get(1)?),
                detail: row.get(2)?,
            })
        })
        .context("query activity")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read activity")?;

    Ok(())
}

fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let checklist: Vec<ChecklistItem> = json_column(row, 13)?;
    let metadata: BTreeMap<String, serde_json::Value> = json_column(row, 14)?;
    Ok(Task {
        id: row.get(0)?,
        level: parse_column(row, 1)?,
        parent_id: row.get(2)?,
        path: row.get(3)?,
        path_order: row.get(4)?,
        project: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        status: parse_column(row, 8)?,
        priority: parse_column(row, 9)?,
        tags: BTreeSet::new(),
        estimated_hours: row.get(10)?,
        actual_hours: row.get(11)?,
        completion_percentage: row.get(12)?,
        dependencies: BTreeSet::new(),
        checklist,
        metadata,
        created_at: from_micros(row.get(15)?),
        updated_at: from_micros(row.get(16)?),
        activity_log: Vec::new(),
    })
}
