//! Local sync-state persistence.
//!
//! A single SQLite file, kept outside the versioned repository, holding:
//! - per-(repo, collection, branch) sync state
//! - tracked deletions, renames and metadata updates awaiting staging
//! - an audit trail of orchestrated operations
//!
//! The file is created lazily on the first write. Reads against a missing or
//! unreadable store return empty results and log a warning; they never fail.
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`schema`] - Database schema definitions
//! - [`sync_state`] - Sync state records
//! - [`tracker`] - Pending deletions, renames and updates

pub mod events;
pub mod migrations;
pub mod schema;
pub mod sync_state;
pub mod tracker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::events::{get_events, insert_event, Event};
use crate::storage::schema::apply_schema;

pub use sync_state::{SyncStateRecord, SyncStatus};
pub use tracker::{PendingDeletion, PendingRename, PendingUpdate};

/// Embedded store for sync state and tracked mutations.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    conn: Option<Connection>,
}

impl StateStore {
    /// Open the store at `path` without creating it.
    ///
    /// An existing file is opened immediately; otherwise the file is created
    /// on the first write. A file that cannot be opened is logged and treated
    /// as empty until a write succeeds.
    #[must_use]
    pub fn open(path: &Path) -> Self {
        let conn = if path.exists() {
            match Self::connect(path) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Sync state store unreadable, treating as empty");
                    None
                }
            }
        } else {
            None
        };
        Self {
            path: Some(path.to_path_buf()),
            conn,
        }
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Some(conn),
        })
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        apply_schema(&conn)?;
        Ok(conn)
    }

    /// Whether a backing database has been opened.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.conn.is_some()
    }

    fn writer(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            let path = self
                .path
                .clone()
                .ok_or_else(|| Error::SyncState("store has no backing path".to_string()))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!(path = %path.display(), "Initializing sync state store");
            self.conn = Some(Self::connect(&path).map_err(|e| Error::SyncState(e.to_string()))?);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::SyncState("store not initialized".to_string()))
    }

    /// Run a read, returning `T::default()` when the store is missing or the
    /// read fails.
    pub(crate) fn read<T, F>(&self, op: &str, f: F) -> T
    where
        T: Default,
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let Some(conn) = &self.conn else {
            return T::default();
        };
        f(conn).unwrap_or_else(|e| {
            warn!(op, error = %e, "Sync state read failed, treating as empty");
            T::default()
        })
    }

    /// Run a write inside an IMMEDIATE transaction, initializing the store
    /// first if needed.
    pub(crate) fn mutate<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<R>,
    {
        let conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| Error::SyncState(e.to_string()))?;
        let result = f(&tx).map_err(|e| Error::SyncState(e.to_string()))?;
        tx.commit().map_err(|e| Error::SyncState(e.to_string()))?;
        Ok(result)
    }

    /// Append an audit event.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn record_event(&mut self, event: &Event) -> Result<()> {
        self.mutate(|tx| insert_event(tx, event)).map(|_| ())
    }

    /// Most recent events for a repository, newest first.
    #[must_use]
    pub fn events(&self, repo_path: &str, limit: Option<u32>) -> Vec<Event> {
        self.read("events", |conn| get_events(conn, repo_path, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::events::EventType;

    #[test]
    fn test_missing_store_reads_empty_and_creates_on_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let mut store = StateStore::open(&path);
        assert!(!store.is_initialized());
        assert!(store.events("/repo", None).is_empty());
        assert!(!path.exists());

        store
            .record_event(&Event::new("/repo", "main", EventType::BranchCreated))
            .unwrap();
        assert!(path.exists());
        assert_eq!(store.events("/repo", None).len(), 1);

        let reopened = StateStore::open(&path);
        assert!(reopened.is_initialized());
        assert_eq!(reopened.events("/repo", None).len(), 1);
    }

    #[test]
    fn test_unreadable_store_is_treated_as_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        std::fs::write(&path, b"this is not a sqlite database at all, just text padding....").unwrap();

        let store = StateStore::open(&path);
        assert!(store.events("/repo", None).is_empty());
    }
}
