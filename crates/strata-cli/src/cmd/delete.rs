//! `st delete` — remove a task, its subtree and their documents.

use crate::output::{OutputMode, render};
use clap::Args;
use serde::Serialize;
use std::io::Write;
use strata_core::Store;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Task id to delete (descendants go with it).
    pub id: String,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: Vec<String>,
}

pub fn run_delete(args: &DeleteArgs, store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let deleted = Deleted {
        deleted: store.delete(&args.id)?,
    };
    render(output, &deleted, |d, w| {
        writeln!(w, "deleted {} task(s)", d.deleted.len())?;
        for id in &d.deleted {
            writeln!(w, "  {id}")?;
        }
        Ok(())
    })
}
