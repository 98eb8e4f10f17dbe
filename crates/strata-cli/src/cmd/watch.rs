//! `st watch` — fold hand edits into the index as they happen.

use clap::Args;
use std::thread;
use std::time::Duration;
use strata_core::Store;
use tracing::info;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Stop after this many seconds instead of running until interrupted.
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,
}

pub fn run_watch(args: &WatchArgs, store: &Store) -> anyhow::Result<()> {
    let _watch = store.watch()?;
    eprintln!(
        "watching {} (debounce {} ms)",
        store.tasks_dir().display(),
        store.config().sync.debounce_ms
    );
    match args.duration {
        Some(secs) => thread::sleep(Duration::from_secs(secs)),
        None => loop {
            thread::park();
        },
    }
    info!(project = %store.project(), "watch finished");
    Ok(())
}
