//! Canonical SQLite schema for the task index.
//!
//! The schema is normalized for queryability and is fully derivable from the
//! task documents:
//! - `tasks` keeps every scalar field of a task plus its materialized path
//! - `task_tags` and `task_dependencies` model multi-valued fields
//! - `task_activity` mirrors each document's activity log
//! - `index_meta` records the schema version and the last rebuild

/// Migration v1: core normalized tables plus index metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('master', 'epic', 'task', 'subtask')),
    parent_id TEXT,
    path TEXT NOT NULL,
    path_sort_key TEXT NOT NULL,
    path_order INTEGER NOT NULL CHECK (path_order > 0),
    depth INTEGER NOT NULL CHECK (depth BETWEEN 1 AND 4),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL CHECK (status IN ('todo', 'in_progress', 'done', 'blocked')),
    priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
    estimated_hours REAL,
    actual_hours REAL,
    completion_percentage INTEGER NOT NULL DEFAULT 0
        CHECK (completion_percentage BETWEEN 0 AND 100),
    checklist_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    content_hash TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    UNIQUE (project, path),
    CHECK ((level = 'master') = (parent_id IS NULL))
);

CREATE TABLE IF NOT EXISTS task_tags (
    task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    tag TEXT NOT NULL CHECK (length(trim(tag)) > 0),
    PRIMARY KEY (task_id, tag)
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    depends_on_task_id TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on_task_id),
    CHECK (task_id <> depends_on_task_id)
);

CREATE TABLE IF NOT EXISTS task_activity (
    task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    action TEXT NOT NULL,
    detail TEXT NOT NULL DEFAULT '',
    at_us INTEGER NOT NULL,
    PRIMARY KEY (task_id, seq)
);

CREATE TABLE IF NOT EXISTS index_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_rebuild_at_us INTEGER NOT NULL DEFAULT 0,
    document_count INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO index_meta (
    id,
    schema_version,
    last_rebuild_at_us,
    document_count
) VALUES (1, 1, 0, 0);
";

/// Migration v2: read-path indexes.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_tasks_parent_order
    ON tasks(parent_id, path_order);

CREATE INDEX IF NOT EXISTS idx_tasks_project_sort
    ON tasks(project, path_sort_key);

CREATE INDEX IF NOT EXISTS idx_tasks_project_level_status
    ON tasks(project, level, status);

CREATE INDEX IF NOT EXISTS idx_task_tags_tag
    ON task_tags(tag, task_id);

CREATE INDEX IF NOT EXISTS idx_task_dependencies_target
    ON task_dependencies(depends_on_task_id, task_id);
";

/// Indexes expected after all migrations are applied.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_tasks_parent_order",
    "idx_tasks_project_sort",
    "idx_tasks_project_level_status",
    "idx_task_tags_tag",
    "idx_task_dependencies_target",
];

/// Tables cleared by a full rebuild, children first.
pub const DATA_TABLES: &[&str] = &["task_activity", "task_dependencies", "task_tags", "tasks"];
