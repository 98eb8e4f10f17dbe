//! `st create` — add a task at a level, under an optional parent.

use crate::output::{OutputMode, kv, render, task_line};
use clap::Args;
use std::io::Write;
use strata_core::{Level, NewTask, Priority, Status, Store};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Task title.
    pub title: String,

    /// Hierarchy level: master, epic, task or subtask.
    #[arg(short, long)]
    pub level: Level,

    /// Parent task id (required for everything below master).
    #[arg(short, long)]
    pub parent: Option<String>,

    #[arg(short, long)]
    pub description: Option<String>,

    #[arg(long)]
    pub status: Option<Status>,

    #[arg(long)]
    pub priority: Option<Priority>,

    /// Tag to attach (repeatable).
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Estimated effort in hours.
    #[arg(long)]
    pub estimate: Option<f64>,
}

impl CreateArgs {
    fn to_new_task(&self) -> NewTask {
        let mut new = NewTask::new(self.level, &self.title);
        if let Some(parent) = &self.parent {
            new = new.under(parent);
        }
        if let Some(description) = &self.description {
            new = new.with_description(description);
        }
        if let Some(status) = self.status {
            new = new.with_status(status);
        }
        if let Some(priority) = self.priority {
            new = new.with_priority(priority);
        }
        for tag in &self.tags {
            new = new.with_tag(tag);
        }
        new.estimated_hours = self.estimate;
        new
    }
}

pub fn run_create(args: &CreateArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let task = store.create(args.to_new_task())?;
    render(output, &task, |task, w| {
        write!(w, "created ")?;
        task_line(w, task, 0)?;
        kv(w, "file", store.tasks_dir().join(format!("{}.md", task.id)).display().to_string())
    })
}
