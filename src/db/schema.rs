//! Versioned schema for the durable store.
//!
//! Each entry is applied once, in order, and bumps `PRAGMA user_version`.
//! Never edit a migration that has shipped; append a new one instead.

pub const MIGRATIONS: &[&str] = &[
  // v1: single task table
  r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#,
  // v2: pending-mutation log alongside the task table
  r#"
ALTER TABLE tasks ADD COLUMN synced INTEGER NOT NULL DEFAULT 1;

CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    local_ref INTEGER,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_ref ON pending_mutations(local_ref);

CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL
);
"#,
  // v3: named response caches and small settings
  r#"
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, cache_key),
    FOREIGN KEY (cache_name) REFERENCES cache_names(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
];
