//! Status propagation: derived completion and parent auto-transitions.
//!
//! Every level above `subtask` derives `completion_percentage` from its
//! direct children. A change below a task re-evaluates each ancestor in turn,
//! up to the project root, inside the same mutation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::StoreConfig;
use crate::model::{Status, Task};

pub const AUTO_COMPLETED: &str = "auto_completed";
pub const AUTO_REOPENED: &str = "auto_reopened";

const AUTO_CLOSE_REASON: &str = "all children complete";
const AUTO_REOPEN_REASON: &str = "child reopened";

/// Policy controlling parent auto-close and auto-reopen behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupPolicy {
    /// Move a parent to `done` when all of its children are done.
    pub auto_close: bool,
    /// Move a `done` parent back to `in_progress` when a child is not done.
    pub auto_reopen: bool,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            auto_close: true,
            auto_reopen: true,
        }
    }
}

impl RollupPolicy {
    /// `rollup.auto_complete` toggles both transitions together.
    #[must_use]
    pub const fn from_config(config: &StoreConfig) -> Self {
        let enabled = config.rollup.auto_complete;
        Self {
            auto_close: enabled,
            auto_reopen: enabled,
        }
    }
}

/// Status counts over a task's direct children.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rollup {
    pub done: usize,
    pub in_progress: usize,
    pub total: usize,
}

impl Rollup {
    #[must_use]
    pub fn of<'a>(children: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut rollup = Self::default();
        for child in children {
            rollup.total += 1;
            match child.status {
                Status::Done => rollup.done += 1,
                Status::InProgress => rollup.in_progress += 1,
                Status::Todo | Status::Blocked => {}
            }
        }
        rollup
    }

    /// `round(100 * done / total)`, rounding halves up; 0 without children.
    #[must_use]
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (200 * self.done + self.total) / (2 * self.total);
        u8::try_from(pct.min(100)).unwrap_or(100)
    }

    #[must_use]
    pub const fn all_done(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

impl fmt::Display for Rollup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}%)", self.done, self.total, self.percentage())
    }
}

/// Status transition decided for a parent, with its activity action and reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: Status,
    pub action: &'static str,
    pub reason: &'static str,
}

/// Decide whether `parent` should change status given its children.
#[must_use]
pub fn evaluate(parent: &Task, rollup: &Rollup, policy: RollupPolicy) -> Option<Transition> {
    if parent.level.has_derived_completion() {
        if policy.auto_close && rollup.all_done() && !parent.status.is_done() {
            return Some(Transition {
                status: Status::Done,
                action: AUTO_COMPLETED,
                reason: AUTO_CLOSE_REASON,
            });
        }
        if policy.auto_reopen && parent.status.is_done() && rollup.total > 0 && !rollup.all_done()
        {
            return Some(Transition {
                status: Status::InProgress,
                action: AUTO_REOPENED,
                reason: AUTO_REOPEN_REASON,
            });
        }
    }
    None
}

/// Apply the derived fields to `parent`. Returns whether anything changed.
///
/// `at` is the mutation timestamp used for any activity entry.
pub fn apply(
    parent: &mut Task,
    rollup: &Rollup,
    policy: RollupPolicy,
    at: chrono::DateTime<chrono::Utc>,
) -> bool {
    if !parent.level.has_derived_completion() {
        return false;
    }

    let mut changed = false;
    let pct = rollup.percentage();
    if parent.completion_percentage != pct {
        parent.completion_percentage = pct;
        changed = true;
    }

    if let Some(transition) = evaluate(parent, rollup, policy) {
        let detail = format!(
            "status {} -> {}: {} ({rollup})",
            parent.status, transition.status, transition.reason
        );
        parent.status = transition.status;
        parent.record(transition.action, detail, at);
        changed = true;
    } else if changed {
        parent.updated_at = parent.updated_at.max(at);
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Level, Priority, now};
    use std::collections::{BTreeMap, BTreeSet};

    fn task(level: Level, status: Status) -> Task {
        let ts = now();
        Task {
            id: format!("{}-x", level.as_str()),
            level,
            parent_id: None,
            path: "1".into(),
            path_order: 1,
            project: "px".into(),
            title: "t".into(),
            description: String::new(),
            status,
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

    fn rollup(done: usize, total: usize) -> Rollup {
        Rollup {
            done,
            in_progress: 0,
            total,
        }
    }

    #[test]
    fn percentage_rounds_half_up() {
        assert_eq!(rollup(0, 0).percentage(), 0);
        assert_eq!(rollup(1, 1).percentage(), 100);
        assert_eq!(rollup(1, 3).percentage(), 33);
        assert_eq!(rollup(2, 3).percentage(), 67);
        assert_eq!(rollup(1, 8).percentage(), 13);
        assert_eq!(rollup(0, 5).percentage(), 0);
    }

    #[test]
    fn counts_children_by_status() {
        let children = [
            task(Level::Task, Status::Done),
            task(Level::Task, Status::InProgress),
            task(Level::Task, Status::Blocked),
        ];
        let r = Rollup::of(&children);
        assert_eq!(
            r,
            Rollup {
                done: 1,
                in_progress: 1,
                total: 3
            }
        );
        assert_eq!(r.to_string(), "1/3 (33%)");
    }

    #[test]
    fn auto_close_and_reopen() {
        let policy = RollupPolicy::default();
        let mut epic = task(Level::Epic, Status::InProgress);

        assert!(apply(&mut epic, &rollup(2, 2), policy, now()));
        assert_eq!(epic.status, Status::Done);
        assert_eq!(epic.completion_percentage, 100);
        assert_eq!(epic.activity_log.last().unwrap().action, AUTO_COMPLETED);

        assert!(apply(&mut epic, &rollup(1, 2), policy, now()));
        assert_eq!(epic.status, Status::InProgress);
        assert_eq!(epic.completion_percentage, 50);
        assert_eq!(epic.activity_log.last().unwrap().action, AUTO_REOPENED);

        assert!(!apply(&mut epic, &rollup(1, 2), policy, now()));
    }

    #[test]
    fn disabled_policy_only_updates_percentage() {
        let config: StoreConfig = toml::from_str("[rollup]\nauto_complete = false\n").unwrap();
        let policy = RollupPolicy::from_config(&config);
        let mut epic = task(Level::Epic, Status::Todo);
        assert!(apply(&mut epic, &rollup(1, 1), policy, now()));
        assert_eq!(epic.status, Status::Todo);
        assert_eq!(epic.completion_percentage, 100);
        assert!(epic.activity_log.is_empty());
    }

    #[test]
    fn childless_done_parent_stays_done() {
        let policy = RollupPolicy::default();
        let mut epic = task(Level::Epic, Status::Done);
        epic.completion_percentage = 100;
        assert!(apply(&mut epic, &rollup(0, 0), policy, now()));
        assert_eq!(epic.status, Status::Done);
        assert_eq!(epic.completion_percentage, 0);
    }

    #[test]
    fn subtasks_are_not_derived() {
        let mut st = task(Level::Subtask, Status::Todo);
        st.completion_percentage = 40;
        assert!(!apply(&mut st, &rollup(1, 1), RollupPolicy::default(), now()));
        assert_eq!(st.completion_percentage, 40);
    }
}
