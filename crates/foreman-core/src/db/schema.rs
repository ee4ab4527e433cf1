//! SQLite schema for the persisted work item graph.
//!
//! - `items` holds one row per work item, including its block diagnostic
//! - `item_edges` holds every typed edge (`depends_on`, `soft_depends_on`,
//!   `parent`); the per-item id sets are rebuilt from it on load
//! - `store_meta` records the schema version and the revision last saved

/// Version 1: items, edges, store metadata, and the query indexes.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
    item_id TEXT PRIMARY KEY,
    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
    body TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL CHECK (kind IN ('task', 'epic', 'bug')),
    status TEXT NOT NULL CHECK (
        status IN ('inbox', 'ready', 'active', 'in_progress', 'review', 'done', 'blocked')
    ),
    priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 4),
    project TEXT NOT NULL DEFAULT '',
    assignee TEXT NOT NULL DEFAULT 'unassigned',
    workspace_ref TEXT,
    block_cause TEXT,
    block_detail TEXT,
    block_at_us INTEGER,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (status = 'inbox' OR length(trim(project)) > 0)
);

CREATE TABLE IF NOT EXISTS item_edges (
    from_id TEXT NOT NULL REFERENCES items(item_id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES items(item_id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('depends_on', 'soft_depends_on', 'parent')),
    PRIMARY KEY (from_id, to_id, kind),
    CHECK (from_id <> to_id)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    saved_at_us INTEGER
);

INSERT OR IGNORE INTO store_meta (id, schema_version, revision) VALUES (1, 0, 0);

CREATE INDEX IF NOT EXISTS idx_items_status_priority
    ON items(status, priority, created_at_us);
CREATE INDEX IF NOT EXISTS idx_items_project ON items(project);
CREATE INDEX IF NOT EXISTS idx_item_edges_target ON item_edges(to_id, kind);
CREATE INDEX IF NOT EXISTS idx_items_assignee ON items(assignee, status);
";

/// Indexes every migrated database must have.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_items_status_priority",
    "idx_items_project",
    "idx_item_edges_target",
    "idx_items_assignee",
];
