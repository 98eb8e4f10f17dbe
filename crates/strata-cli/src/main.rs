#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render, render_error};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::{Store, StoreError, Workspace};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_PROJECT: &str = "default";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "strata: hierarchical task store backed by Markdown files",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Data root holding config.toml and projects/ (default: $STRATA_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Project to operate on (default: $STRATA_PROJECT, then "default").
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        OutputMode::from_flag(self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Tasks",
        about = "Create a task",
        long_about = "Create a task at a hierarchy level, optionally under a parent.",
        after_help = "EXAMPLES:\n    # Start a project\n    st create \"Project X\" --level master\n\n    # Add an epic under it\n    st create \"Phase 1\" --level epic --parent ms-1a2b3c4d5e\n\n    # Emit machine-readable output\n    st create \"Build API\" --level task --parent ep-1a2b3c4d5e --json"
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Tasks",
        about = "Move a task under a new parent",
        long_about = "Move a task and its subtree under a new parent, recomputing paths.",
        after_help = "EXAMPLES:\n    # Move a task to another epic\n    st move tk-1a2b3c4d5e --parent ep-5e4d3c2b1a\n\n    # Promote a master back to the top\n    st move ms-1a2b3c4d5e --parent none"
    )]
    Move(cmd::move_cmd::MoveArgs),

    #[command(
        next_help_heading = "Tasks",
        about = "Change fields of a task",
        after_help = "EXAMPLES:\n    # Mark a task done\n    st update tk-1a2b3c4d5e --status done\n\n    # Replace tags and set metadata\n    st update tk-1a2b3c4d5e --tag api --tag backend --meta points=3\n\n    # Replace the checklist\n    st update st-1a2b3c4d5e --check \"[x] write handler\" --check \"add tests\""
    )]
    Update(cmd::update::UpdateArgs),

    #[command(
        next_help_heading = "Tasks",
        about = "Delete a task and its subtree",
        after_help = "EXAMPLES:\n    # Delete an epic with everything below it\n    st delete ep-1a2b3c4d5e\n\n    # Emit machine-readable output\n    st delete ep-1a2b3c4d5e --json"
    )]
    Delete(cmd::delete::DeleteArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show one task",
        after_help = "EXAMPLES:\n    # Show a task\n    st show tk-1a2b3c4d5e\n\n    # Emit machine-readable output\n    st show tk-1a2b3c4d5e --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Read",
        about = "Print the hierarchy",
        after_help = "EXAMPLES:\n    # Whole project\n    st tree\n\n    # One epic, two levels deep, without finished work\n    st tree ep-1a2b3c4d5e --depth 2 --hide-done"
    )]
    Tree(cmd::tree::TreeArgs),

    #[command(
        next_help_heading = "Read",
        about = "List tasks matching filters",
        after_help = "EXAMPLES:\n    # Blocked tasks\n    st list --level task --status blocked\n\n    # Direct children of an epic\n    st list --parent ep-1a2b3c4d5e"
    )]
    List(cmd::list::ListArgs),

    #[command(next_help_heading = "Read", about = "List projects under the data root")]
    Projects,

    #[command(
        next_help_heading = "Maintenance",
        about = "Rebuild the index from task documents",
        after_help = "EXAMPLES:\n    # Full rebuild\n    st rebuild\n\n    # Emit machine-readable output\n    st rebuild --json"
    )]
    Rebuild,

    #[command(
        next_help_heading = "Maintenance",
        about = "Reconcile hand edits to task documents as they happen",
        after_help = "EXAMPLES:\n    # Watch until interrupted\n    st watch\n\n    # Watch for one minute\n    st watch --duration 60"
    )]
    Watch(cmd::watch::WatchArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "strata=debug,info"
        } else {
            "strata=info,warn"
        })
    });

    let format = env::var("STRATA_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Flag, then `$STRATA_ROOT`, then the platform data directory.
fn resolve_root(flag: Option<PathBuf>, env_value: Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(root) = env_value.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    dirs::data_dir()
        .map(|dir| dir.join("strata"))
        .ok_or_else(|| anyhow::anyhow!("no data directory on this platform; pass --root"))
}

/// Flag, then `$STRATA_PROJECT`, then [`DEFAULT_PROJECT`].
fn resolve_project(flag: Option<String>, env_value: Option<String>) -> String {
    flag.or_else(|| env_value.filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
}

fn list_projects(root: PathBuf, output: OutputMode) -> anyhow::Result<()> {
    let projects = Workspace::open(root)?.projects()?;
    render(output, &projects, |projects, w| {
        if projects.is_empty() {
            return writeln!(w, "no projects");
        }
        for project in projects {
            writeln!(w, "{project}")?;
        }
        Ok(())
    })
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let output = cli.output_mode();
    let root = resolve_root(cli.root, env::var("STRATA_ROOT").ok())?;
    if matches!(cli.command, Commands::Projects) {
        return list_projects(root, output);
    }
    let project = resolve_project(cli.project, env::var("STRATA_PROJECT").ok());
    debug!(root = %root.display(), %project, "opening store");
    let store = Store::open(&root, &project)?;

    match &cli.command {
        Commands::Create(args) => cmd::create::run_create(args, &store, output),
        Commands::Move(args) => cmd::move_cmd::run_move(args, &store, output),
        Commands::Update(args) => cmd::update::run_update(args, &store, output),
        Commands::Delete(args) => cmd::delete::run_delete(args, &store, output),
        Commands::Show(args) => cmd::show::run_show(args, &store, output),
        Commands::Tree(args) => cmd::tree::run_tree(args, &store, output),
        Commands::List(args) => cmd::list::run_list(args, &store, output),
        Commands::Rebuild => cmd::rebuild::run_rebuild(&store, output),
        Commands::Watch(args) => cmd::watch::run_watch(args, &store),
        Commands::Projects => Ok(()),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = cli.output_mode();

    match run(cli) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(store_err) => {
                render_error(output, &CliError::from(store_err))?;
                Ok(ExitCode::FAILURE)
            }
            None => Err(err),
        },
    }
}
