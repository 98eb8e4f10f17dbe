//! `st show` — everything known about one task.

use crate::output::{OutputMode, kv, render, section};
use clap::Args;
use serde::Serialize;
use std::io::Write;
use strata_core::{Store, SubtreeCounts, Task};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Task id to show.
    pub id: String,
}

#[derive(Serialize)]
struct Shown {
    #[serde(flatten)]
    task: Task,
    subtree: SubtreeCounts,
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let joined = items.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() { "-".to_string() } else { joined }
}

fn hours(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |h| format!("{h}h"))
}

pub fn run_show(args: &ShowArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let shown = Shown {
        task: store.get(&args.id)?,
        subtree: store.counts(&args.id)?,
    };
    render(output, &shown, |shown, w| {
        let task = &shown.task;
        section(w, &format!("{} {}", task.path, task.title))?;
        kv(w, "id", &task.id)?;
        kv(w, "level", task.level.as_str())?;
        kv(w, "parent", task.parent_id.as_deref().unwrap_or("-"))?;
        kv(w, "status", task.status.as_str())?;
        kv(w, "priority", task.priority.as_str())?;
        kv(w, "complete", format!("{}%", task.completion_percentage))?;
        kv(w, "tags", join(&task.tags))?;
        kv(w, "depends on", join(&task.dependencies))?;
        kv(w, "estimate", hours(task.estimated_hours))?;
        kv(w, "actual", hours(task.actual_hours))?;
        kv(w, "created", task.created_at.to_rfc3339())?;
        kv(w, "updated", task.updated_at.to_rfc3339())?;
        if shown.subtree.total > 0 {
            kv(
                w,
                "subtree",
                format!(
                    "{} tasks, {} done, {} in progress",
                    shown.subtree.total, shown.subtree.completed, shown.subtree.in_progress
                ),
            )?;
        }
        for (key, value) in &task.metadata {
            kv(w, key, value.to_string())?;
        }

        if !task.description.is_empty() {
            writeln!(w)?;
            section(w, "Description")?;
            writeln!(w, "{}", task.description.trim_end())?;
        }
        if !task.checklist.is_empty() {
            writeln!(w)?;
            section(w, "Checklist")?;
            for item in &task.checklist {
                writeln!(w, "[{}] {}", if item.done { 'x' } else { ' ' }, item.text)?;
            }
        }
        if !task.activity_log.is_empty() {
            writeln!(w)?;
            section(w, "Activity")?;
            for entry in &task.activity_log {
                writeln!(
                    w,
                    "{}  {:<14} {}",
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action,
                    entry.detail
                )?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn empty_lists_render_as_dash() {
        assert_eq!(join(&BTreeSet::new()), "-");
        let tags: BTreeSet<String> = ["api".to_string(), "backend".to_string()].into();
        assert_eq!(join(&tags), "api, backend");
    }

    #[test]
    fn hours_format() {
        assert_eq!(hours(None), "-");
        assert_eq!(hours(Some(2.5)), "2.5h");
    }
}
