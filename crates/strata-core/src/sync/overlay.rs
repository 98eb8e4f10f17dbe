//! In-memory view of planned changes layered over the index.
//!
//! A mutation is planned entirely against an [`Overlay`]: validation,
//! re-pathing, and roll-up all read through it, so they see the tasks as they
//! will be once the plan is committed. Nothing touches disk until then.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rusqlite::Connection;

use crate::db::query;
use crate::model::Task;

pub struct Overlay<'conn> {
    conn: &'conn Connection,
    staged: HashMap<String, Task>,
    order: Vec<String>,
    removed: HashSet<String>,
}

impl<'conn> Overlay<'conn> {
    #[must_use]
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            staged: HashMap::new(),
            order: Vec::new(),
            removed: HashSet::new(),
        }
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        if self.removed.contains(task_id) {
            return Ok(None);
        }
        if let Some(task) = self.staged.get(task_id) {
            return Ok(Some(task.clone()));
        }
        query::get_task(self.conn, task_id)
    }

    pub fn parent_of(&self, task_id: &str) -> Result<Option<String>> {
        Ok(self.get(task_id)?.and_then(|t| t.parent_id))
    }

    /// Children of `parent_id` (roots for `None`) in sibling order.
    pub fn children(&self, parent_id: Option<&str>) -> Result<Vec<Task>> {
        let mut out: Vec<Task> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for row in query::get_children(self.conn, parent_id)? {
            if self.removed.contains(&row.id) {
                continue;
            }
            let task = self.staged.get(&row.id).cloned().unwrap_or(row);
            if task.parent_id.as_deref() == parent_id {
                seen.insert(task.id.clone());
                out.push(task);
            }
        }

        for id in &self.order {
            if seen.contains(id) || self.removed.contains(id) {
                continue;
            }
            if let Some(task) = self.staged.get(id) {
                if task.parent_id.as_deref() == parent_id {
                    out.push(task.clone());
                }
            }
        }

        out.sort_by_key(|t| t.path_order);
        Ok(out)
    }

    /// Next free sibling order under `parent_id`: one past the largest in use.
    pub fn next_order(&self, parent_id: Option<&str>) -> Result<u32> {
        let max = self
            .children(parent_id)?
            .iter()
            .map(|t| t.path_order)
            .max()
            .unwrap_or(0);
        Ok(max.saturating_add(1))
    }

    /// The task and all its descendants, parents before children.
    pub fn subtree(&self, task_id: &str) -> Result<Vec<Task>> {
        let Some(root) = self.get(task_id)? else {
            return Ok(Vec::new());
        };
        let mut out = vec![root];
        let mut visited: HashSet<String> = HashSet::from([task_id.to_string()]);
        let mut cursor = 0;
        while cursor < out.len() {
            let id = out[cursor].id.clone();
            for child in self.children(Some(&id))? {
                if visited.insert(child.id.clone()) {
                    out.push(child);
                }
            }
            cursor += 1;
        }
        Ok(out)
    }

    /// Ancestors of `task_id`, nearest first.
    pub fn ancestors(&self, task_id: &str) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = self.parent_of(task_id)?;
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break;
            }
            let Some(task) = self.get(&id)? else {
                break;
            };
            current = task.parent_id.clone();
            out.push(task);
        }
        Ok(out)
    }

    pub fn stage(&mut self, task: Task) {
        self.removed.remove(&task.id);
        if !self.staged.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.staged.insert(task.id.clone(), task);
    }

    pub fn remove(&mut self, task_id: &str) {
        self.staged.remove(task_id);
        self.order.retain(|id| id != task_id);
        self.removed.insert(task_id.to_string());
    }

    /// Staged tasks in staging order, and removed ids (sorted).
    #[must_use]
    pub fn into_changes(mut self) -> (Vec<Task>, Vec<String>) {
        let writes = self
            .order
            .iter()
            .filter_map(|id| self.staged.remove(id))
            .collect();
        let mut removed: Vec<String> = self.removed.into_iter().collect();
        removed.sort();
        (writes, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migrations::migrate, write::upsert_task};
    use crate::model::{Level, Priority, Status, now};
    use std::collections::{BTreeMap, BTreeSet};

    fn task(id: &str, level: Level, parent: Option<&str>, path: &str, order: u32) -> Task {
        let ts = now();
        Task {
            id: id.into(),
            level,
            parent_id: parent.map(str::to_string),
            path: path.into(),
            path_order: order,
            project: "px".into(),
            title: id.into(),
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

    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        for t in [
            task("ms", Level::Master, None, "1", 1),
            task("ep1", Level::Epic, Some("ms"), "1.1", 1),
            task("ep2", Level::Epic, Some("ms"), "1.2", 2),
            task("tk", Level::Task, Some("ep1"), "1.1.1", 1),
        ] {
            upsert_task(&conn, &t, "h").unwrap();
        }
        conn
    }

    #[test]
    fn staged_moves_are_visible_to_children_queries() {
        let conn = seeded();
        let mut overlay = Overlay::new(&conn);

        let mut moved = overlay.get("tk").unwrap().unwrap();
        moved.parent_id = Some("ep2".into());
        moved.path = "1.2.1".into();
        overlay.stage(moved);

        assert!(overlay.children(Some("ep1")).unwrap().is_empty());
        let under_ep2: Vec<_> = overlay
            .children(Some("ep2"))
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(under_ep2, vec!["tk"]);
        assert_eq!(overlay.next_order(Some("ms")).unwrap(), 3);
    }

    #[test]
    fn removed_tasks_disappear() {
        let conn = seeded();
        let mut overlay = Overlay::new(&conn);
        overlay.remove("ep1");
        assert!(overlay.get("ep1").unwrap().is_none());
        assert_eq!(overlay.children(Some("ms")).unwrap().len(), 1);
        let (writes, removed) = overlay.into_changes();
        assert!(writes.is_empty());
        assert_eq!(removed, vec!["ep1".to_string()]);
    }

    #[test]
    fn subtree_and_ancestors() {
        let conn = seeded();
        let mut overlay = Overlay::new(&conn);
        overlay.stage(task("st", Level::Subtask, Some("tk"), "1.1.1.1", 1));

        let ids: Vec<_> = overlay
            .subtree("ms")
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["ms", "ep1", "ep2", "tk", "st"]);

        let chain: Vec<_> = overlay
            .ancestors("st")
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(chain, vec!["tk", "ep1", "ms"]);
        assert_eq!(overlay.parent_of("ep2").unwrap().as_deref(), Some("ms"));
    }
}
