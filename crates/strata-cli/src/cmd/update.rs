//! `st update` — change fields of one task.
//!
//! Set-valued flags (`--tag`, `--dep`, `--check`) replace the whole set;
//! `--meta key=value` merges into the existing metadata.

use crate::output::{OutputMode, render, task_line};
use anyhow::{Context, bail};
use clap::Args;
use std::collections::BTreeSet;
use std::io::Write;
use strata_core::{ChecklistItem, Priority, Status, Store, TaskChanges};

#[derive(Args, Debug, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct UpdateArgs {
    /// Task id to update.
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(short, long)]
    pub description: Option<String>,

    #[arg(short, long)]
    pub status: Option<Status>,

    #[arg(long)]
    pub priority: Option<Priority>,

    /// Replace the tags (repeatable).
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Remove every tag.
    #[arg(long, conflicts_with = "tags")]
    pub clear_tags: bool,

    #[arg(long)]
    pub estimate: Option<f64>,

    #[arg(long, conflicts_with = "estimate")]
    pub clear_estimate: bool,

    #[arg(long)]
    pub actual: Option<f64>,

    #[arg(long, conflicts_with = "actual")]
    pub clear_actual: bool,

    /// Completion percentage (subtasks only).
    #[arg(long)]
    pub completion: Option<u8>,

    /// Replace the dependencies (repeatable).
    #[arg(long = "dep")]
    pub dependencies: Vec<String>,

    #[arg(long, conflicts_with = "dependencies")]
    pub clear_deps: bool,

    /// Replace the checklist; prefix an item with "[x] " to mark it done.
    #[arg(long = "check")]
    pub checklist: Vec<String>,

    /// Set a metadata entry; the value is parsed as JSON when possible.
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    pub metadata: Vec<String>,
}

fn replace_set(values: &[String], clear: bool) -> Option<BTreeSet<String>> {
    (clear || !values.is_empty()).then(|| values.iter().cloned().collect())
}

fn optional_hours(value: Option<f64>, clear: bool) -> Option<Option<f64>> {
    if clear { Some(None) } else { value.map(Some) }
}

fn checklist_item(raw: &str) -> ChecklistItem {
    raw.strip_prefix("[x] ")
        .or_else(|| raw.strip_prefix("[X] "))
        .map_or_else(
            || ChecklistItem::new(raw.strip_prefix("[ ] ").unwrap_or(raw), false),
            |text| ChecklistItem::new(text, true),
        )
}

fn meta_entry(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("--meta expects KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::from(value));
    Ok((key.trim().to_string(), value))
}

impl UpdateArgs {
    fn to_changes(&self, store: &Store) -> anyhow::Result<TaskChanges> {
        let metadata = if self.metadata.is_empty() {
            None
        } else {
            let mut current = store.get(&self.id)?.metadata;
            for raw in &self.metadata {
                let (key, value) = meta_entry(raw)?;
                current.insert(key, value);
            }
            Some(current)
        };
        Ok(TaskChanges {
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            tags: replace_set(&self.tags, self.clear_tags),
            estimated_hours: optional_hours(self.estimate, self.clear_estimate),
            actual_hours: optional_hours(self.actual, self.clear_actual),
            completion_percentage: self.completion,
            dependencies: replace_set(&self.dependencies, self.clear_deps),
            checklist: (!self.checklist.is_empty())
                .then(|| self.checklist.iter().map(String::as_str).map(checklist_item).collect()),
            metadata,
            ..TaskChanges::default()
        })
    }
}

pub fn run_update(args: &UpdateArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let changes = args.to_changes(store)?;
    if changes.is_empty() {
        bail!("nothing to update: pass at least one field flag");
    }
    let task = store.update(&args.id, changes)?;
    render(output, &task, |task, w| {
        write!(w, "updated ")?;
        task_line(w, task, 0)
    })
}
