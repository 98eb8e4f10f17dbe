//! Schema versioning for the task index.
//!
//! The index is disposable, so there is no downgrade path: a file stamped
//! with a version newer than this binary knows is refused, and startup
//! recovery quarantines it and rebuilds from the task documents.

use super::schema;
use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use tracing::debug;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tables",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "read-path indexes",
        sql: schema::MIGRATION_V2_SQL,
    },
];

/// Schema version written by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// `PRAGMA user_version` of `conn`.
///
/// # Errors
///
/// Fails if the pragma cannot be read or holds a negative value.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let raw: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("read user_version")?;
    u32::try_from(raw).with_context(|| format!("invalid user_version {raw}"))
}

/// Bring the schema up to [`LATEST_SCHEMA_VERSION`], one transaction per step.
///
/// Returns the resulting version.
///
/// # Errors
///
/// Fails if the file was written by a newer schema or a step fails.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let found = schema_version(conn)?;
    if found > LATEST_SCHEMA_VERSION {
        bail!("index schema v{found} is newer than supported v{LATEST_SCHEMA_VERSION}");
    }

    for step in MIGRATIONS.iter().filter(|m| m.version > found) {
        let version = i64::from(step.version);
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)
            .with_context(|| format!("migration v{} ({})", step.version, step.name))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.execute("UPDATE index_meta SET schema_version = ?1 WHERE id = 1", [version])?;
        tx.commit()?;
        debug!(version = step.version, name = step.name, "applied index migration");
    }

    Ok(LATEST_SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_object(conn: &Connection, kind: &str, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            [kind, name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn fresh_database_gets_every_table_and_index() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), LATEST_SCHEMA_VERSION);
        assert_eq!(schema_version(&conn).unwrap(), LATEST_SCHEMA_VERSION);

        for table in ["tasks", "task_tags", "task_dependencies", "task_activity", "index_meta"] {
            assert!(has_object(&conn, "table", table), "{table}");
        }
        for index in schema::REQUIRED_INDEXES {
            assert!(has_object(&conn, "index", index), "{index}");
        }
    }

    #[test]
    fn rerunning_keeps_a_single_meta_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let (rows, version): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(schema_version) FROM index_meta",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(version, i64::from(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn v1_file_gains_the_indexes() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(schema::MIGRATION_V1_SQL).unwrap();
        conn.pragma_update(None, "user_version", 1_i64).unwrap();

        migrate(&mut conn).unwrap();
        assert!(has_object(&conn, "index", "idx_tasks_parent_order"));
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99_i64).unwrap();
        let err = migrate(&mut conn).unwrap_err();
        assert!(err.to_string().contains("v99"));
    }
}
