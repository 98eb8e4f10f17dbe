//! `st tree` — the hierarchy as an indented forest.

use crate::output::{OutputMode, render, task_line};
use clap::Args;
use std::io::{self, Write};
use strata_core::{Store, TreeNode, TreeRoot};

#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Start at this task instead of the whole project.
    pub root: Option<String>,

    /// Levels to show, counting the root as 1.
    #[arg(short, long)]
    pub depth: Option<usize>,

    /// Leave out done tasks together with their subtrees.
    #[arg(long)]
    pub hide_done: bool,
}

fn write_node(w: &mut dyn Write, node: &TreeNode, indent: usize) -> io::Result<()> {
    task_line(w, &node.task, indent)?;
    for child in &node.children {
        write_node(w, child, indent + 1)?;
    }
    Ok(())
}

pub fn run_tree(args: &TreeArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let root = args
        .root
        .clone()
        .map_or(TreeRoot::Project, TreeRoot::Task);
    let forest = store.get_tree(&root, args.depth, !args.hide_done)?;
    render(output, &forest, |forest, w| {
        if forest.is_empty() {
            return writeln!(w, "no tasks");
        }
        for node in forest {
            write_node(w, node, 0)?;
        }
        Ok(())
    })
}
