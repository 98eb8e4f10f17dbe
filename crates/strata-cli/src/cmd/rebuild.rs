//! `st rebuild` — regenerate the index from the task documents.

use crate::output::{OutputMode, kv, render, section};
use std::io::Write;
use strata_core::Store;

pub fn run_rebuild(store: &Store, output: OutputMode) -> anyhow::Result<()> {
    let report = store.rebuild()?;
    render(output, &report, |r, w| {
        section(w, "Index rebuilt")?;
        kv(w, "documents", r.document_count.to_string())?;
        kv(w, "tasks", r.task_count.to_string())?;
        kv(w, "repathed", r.repathed.len().to_string())?;
        kv(w, "refreshed", r.refreshed.to_string())?;
        kv(w, "elapsed", format!("{} ms", r.elapsed.as_millis()))?;
        if !r.skipped.is_empty() {
            writeln!(w)?;
            section(w, "Skipped documents")?;
            for skip in &r.skipped {
                writeln!(w, "{}: {}", skip.file.display(), skip.reason)?;
            }
        }
        Ok(())
    })
}
