//! Database schema for the local sync-state store.
//!
//! This database lives outside the versioned repository and is never part of
//! its commits. Timestamps are stored as INTEGER (Unix milliseconds).

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the sync-state database.
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Per-branch Sync State
-- ====================

-- One row per (repo, collection, branch); never shared across branches
CREATE TABLE IF NOT EXISTS sync_state (
    repo_path TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    branch TEXT NOT NULL,
    last_sync_commit TEXT,
    last_sync_at INTEGER,
    document_count INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    embedding_model TEXT,
    sync_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (sync_status IN ('pending', 'syncing', 'synced', 'error')),
    local_changes_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (repo_path, collection_name, branch)
);

-- ====================
-- Tracked Mutations Awaiting Staging
-- ====================

-- doc_id NULL means the whole collection was deleted
CREATE TABLE IF NOT EXISTS pending_deletions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    doc_id TEXT,
    original_metadata TEXT,
    branch TEXT NOT NULL,
    commit_hash TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_renames (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    old_name TEXT NOT NULL,
    new_name TEXT NOT NULL,
    branch TEXT NOT NULL,
    commit_hash TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    old_metadata TEXT NOT NULL DEFAULT '{}',
    new_metadata TEXT NOT NULL DEFAULT '{}',
    branch TEXT NOT NULL,
    commit_hash TEXT,
    created_at INTEGER NOT NULL
);

-- ====================
-- Audit Trail
-- ====================

CREATE TABLE IF NOT EXISTS sync_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    branch TEXT NOT NULL,
    collection_name TEXT,
    event_type TEXT NOT NULL,
    commit_hash TEXT,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_events_repo ON sync_events(repo_path, created_at);
";

/// Apply the schema to the database.
///
/// Idempotent: every statement uses `IF NOT EXISTS`, and migrations already
/// recorded in `schema_migrations` are skipped.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(SCHEMA_SQL)?;

    super::migrations::run_migrations(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "sync_state",
            "pending_deletions",
            "pending_renames",
            "pending_updates",
            "sync_events",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("First apply failed");
        apply_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_sync_status_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let ok = conn.execute(
            "INSERT INTO sync_state (repo_path, collection_name, branch, sync_status, created_at, updated_at)
             VALUES ('/r', 'c', 'main', 'synced', 0, 0)",
            [],
        );
        assert!(ok.is_ok());

        let bad = conn.execute(
            "INSERT INTO sync_state (repo_path, collection_name, branch, sync_status, created_at, updated_at)
             VALUES ('/r', 'c', 'feature', 'bogus', 0, 0)",
            [],
        );
        assert!(bad.is_err());
    }
}
