//! SQLite task index.
//!
//! One writer connection per project (owned by the writer thread) and any
//! number of short-lived, query-only readers. WAL keeps readers off the
//! writer's lock.

pub mod migrations;
pub mod query;
pub mod rebuild;
pub mod schema;
pub mod write;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File name of the index inside a project directory.
pub const INDEX_FILE: &str = "index.db";

/// Open the writer connection, creating and migrating the file as needed.
///
/// # Errors
///
/// Fails if the file cannot be opened as SQLite or its schema cannot be
/// brought up to date.
pub fn open_index(path: &Path) -> Result<Connection> {
    let mut conn =
        Connection::open(path).with_context(|| format!("open index {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("enable WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
        .context("set writer pragmas")?;
    migrations::migrate(&mut conn)?;
    tracing::trace!(path = %path.display(), journal = %mode, "index opened");
    Ok(conn)
}

/// Open a query-only connection to an existing index.
///
/// # Errors
///
/// Fails if the file is missing or cannot be opened.
pub fn open_reader(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open index reader {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "query_only", true)
        .context("set query_only")?;
    Ok(conn)
}

/// `PRAGMA quick_check` verdict.
///
/// # Errors
///
/// Fails when the pragma cannot run at all, e.g. on a file that is not SQLite.
pub fn quick_check(conn: &Connection) -> Result<bool> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("quick_check")?;
    Ok(verdict == "ok")
}
