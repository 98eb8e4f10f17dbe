//! `st move` — re-parent a task and its subtree.

use crate::output::{OutputMode, render, task_line};
use clap::Args;
use std::io::Write;
use strata_core::Store;

#[derive(Args, Debug)]
pub struct MoveArgs {
    /// Task id to move.
    pub id: String,

    /// New parent id. Use "--parent none" to make a master a root again.
    #[arg(short, long)]
    pub parent: String,
}

impl MoveArgs {
    fn new_parent(&self) -> Option<&str> {
        if self.parent.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(self.parent.as_str())
        }
    }
}

pub fn run_move(args: &MoveArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let moved = store.move_task(&args.id, args.new_parent())?;
    render(output, &moved, |moved, w| {
        write!(w, "moved ")?;
        task_line(w, &moved.task, 0)?;
        for task in &moved.descendants {
            task_line(w, task, 1)?;
        }
        Ok(())
    })
}
