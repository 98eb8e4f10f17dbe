//! `st list` — filtered flat listing in path order.

use crate::output::{OutputMode, render, task_line};
use clap::Args;
use std::io::Write;
use strata_core::{Level, Status, Store, TaskFilter};

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(short, long)]
    pub level: Option<Level>,

    #[arg(short, long)]
    pub status: Option<Status>,

    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only direct children of this task.
    #[arg(short, long)]
    pub parent: Option<String>,

    #[arg(long)]
    pub limit: Option<u32>,
}

impl ListArgs {
    fn filter(&self) -> TaskFilter {
        TaskFilter {
            level: self.level,
            status: self.status,
            tag: self.tag.clone(),
            parent_id: self.parent.clone(),
            limit: self.limit,
        }
    }
}

pub fn run_list(args: &ListArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let tasks = store.list(&args.filter())?;
    render(output, &tasks, |tasks, w| {
        if tasks.is_empty() {
            return writeln!(w, "no tasks");
        }
        for task in tasks {
            task_line(w, task, 0)?;
        }
        Ok(())
    })
}
