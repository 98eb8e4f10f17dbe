//! Shared output layer: readable text for humans, stable JSON for tools.
//!
//! Every command handler receives an [`OutputMode`] and formats through
//! [`render`], so `--json` behaves the same across commands.

use serde::Serialize;
use std::io::{self, Write};
use strata_core::{StoreError, Task};

/// Shared width for separators in human output.
pub const RULE_WIDTH: usize = 72;

/// Write a horizontal separator.
pub fn rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    rule(w)
}

/// Left-aligned key/value line.
pub fn kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

/// The two output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Human }
    }

    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Render a serializable value to stdout.
///
/// JSON mode pretty-prints `value`; human mode hands the writer to
/// `human_fn`.
pub fn render<T: Serialize + ?Sized>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, &mut out)?,
    }
    Ok(())
}

/// One line per task: `path  [status] title  (id)`.
pub fn task_line(w: &mut dyn Write, task: &Task, indent: usize) -> io::Result<()> {
    let pct = if task.level.has_derived_completion() || task.completion_percentage > 0 {
        format!(" {}%", task.completion_percentage)
    } else {
        String::new()
    };
    writeln!(
        w,
        "{:indent$}{:<10} [{}] {}{pct}  ({})",
        "",
        task.path,
        task.status,
        task.title,
        task.id,
        indent = indent * 2
    )
}

/// A structured error with its stable code and an optional hint.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&StoreError> for CliError {
    fn from(err: &StoreError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            hint: err.hint().map(str::to_string),
        }
    }
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(&mut out, mode, error)?;
    Ok(())
}

fn write_error(w: &mut dyn Write, mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut *w, &wrapper)?;
            writeln!(w)?;
        }
        OutputMode::Human => {
            writeln!(w, "error[{}]: {}", error.code, error.message)?;
            if let Some(hint) = &error.hint {
                writeln!(w, "  hint: {hint}")?;
            }
        }
    }
    Ok(())
}
