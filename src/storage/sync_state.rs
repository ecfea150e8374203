//! Per-(repo, collection, branch) sync state records.
//!
//! A record is created on the first commit or full sync of a collection on a
//! branch. Branches never share records: a new branch starts with none.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::StateStore;
use crate::error::Result;

/// Lifecycle of a collection's sync on one branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "synced" => Self::Synced,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// Bookkeeping for one collection on one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub repo_path: String,
    pub collection_name: String,
    pub branch: String,
    pub last_sync_commit: Option<String>,
    pub last_sync_at: Option<i64>,
    /// Logical documents.
    pub document_count: usize,
    /// Raw document-store entries.
    pub chunk_count: usize,
    pub embedding_model: Option<String>,
    pub sync_status: SyncStatus,
    pub local_changes_count: usize,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncStateRecord {
    /// A pending record with no sync history.
    #[must_use]
    pub fn new(repo_path: &str, collection_name: &str, branch: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            repo_path: repo_path.to_string(),
            collection_name: collection_name.to_string(),
            branch: branch.to_string(),
            last_sync_commit: None,
            last_sync_at: None,
            document_count: 0,
            chunk_count: 0,
            embedding_model: None,
            sync_status: SyncStatus::Pending,
            local_changes_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the record synced at `commit` with fresh counts.
    #[must_use]
    pub fn synced(mut self, commit: Option<String>, document_count: usize, chunk_count: usize) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_sync_commit = commit;
        self.last_sync_at = Some(now);
        self.document_count = document_count;
        self.chunk_count = chunk_count;
        self.sync_status = SyncStatus::Synced;
        self.local_changes_count = 0;
        self.error_message = None;
        self.updated_at = now;
        self
    }
}

const COLUMNS: &str = "repo_path, collection_name, branch, last_sync_commit, last_sync_at, \
     document_count, chunk_count, embedding_model, sync_status, local_changes_count, \
     error_message, created_at, updated_at";

fn map_record(row: &Row) -> rusqlite::Result<SyncStateRecord> {
    let count = |idx: usize| -> rusqlite::Result<usize> {
        Ok(usize::try_from(row.get::<_, i64>(idx)?).unwrap_or(0))
    };
    Ok(SyncStateRecord {
        repo_path: row.get(0)?,
        collection_name: row.get(1)?,
        branch: row.get(2)?,
        last_sync_commit: row.get(3)?,
        last_sync_at: row.get(4)?,
        document_count: count(5)?,
        chunk_count: count(6)?,
        embedding_model: row.get(7)?,
        sync_status: SyncStatus::parse(&row.get::<_, String>(8)?),
        local_changes_count: count(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl StateStore {
    /// Get the record for one key, or `None` (also when the store is unreadable).
    #[must_use]
    pub fn get_sync_state(&self, repo_path: &str, collection: &str, branch: &str) -> Option<SyncStateRecord> {
        self.read("get_sync_state", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLUMNS} FROM sync_state
                     WHERE repo_path = ?1 AND collection_name = ?2 AND branch = ?3"
                ),
                params![repo_path, collection, branch],
                map_record,
            )
            .optional()
        })
    }

    /// Insert or replace the record for its key. `created_at` of an existing
    /// record is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn upsert_sync_state(&mut self, record: &SyncStateRecord) -> Result<()> {
        self.mutate(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO sync_state ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(repo_path, collection_name, branch) DO UPDATE SET
                       last_sync_commit = excluded.last_sync_commit,
                       last_sync_at = excluded.last_sync_at,
                       document_count = excluded.document_count,
                       chunk_count = excluded.chunk_count,
                       embedding_model = excluded.embedding_model,
                       sync_status = excluded.sync_status,
                       local_changes_count = excluded.local_changes_count,
                       error_message = excluded.error_message,
                       updated_at = excluded.updated_at"
                ),
                params![
                    record.repo_path,
                    record.collection_name,
                    record.branch,
                    record.last_sync_commit,
                    record.last_sync_at,
                    to_i64(record.document_count),
                    to_i64(record.chunk_count),
                    record.embedding_model,
                    record.sync_status.as_str(),
                    to_i64(record.local_changes_count),
                    record.error_message,
                    record.created_at,
                    record.updated_at,
                ],
            )
        })
        .map(|_| ())
    }

    /// Every record of a repository, across branches.
    #[must_use]
    pub fn list_sync_states(&self, repo_path: &str) -> Vec<SyncStateRecord> {
        self.read("list_sync_states", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sync_state WHERE repo_path = ?1
                 ORDER BY branch, collection_name"
            ))?;
            let rows = stmt.query_map([repo_path], map_record)?;
            rows.collect()
        })
    }

    /// Records of a repository on one branch.
    #[must_use]
    pub fn list_branch_sync_states(&self, repo_path: &str, branch: &str) -> Vec<SyncStateRecord> {
        self.list_sync_states(repo_path)
            .into_iter()
            .filter(|r| r.branch == branch)
            .collect()
    }

    /// Remove the record for one key. Returns whether a record existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn delete_sync_state(&mut self, repo_path: &str, collection: &str, branch: &str) -> Result<bool> {
        if !self.is_initialized() {
            return Ok(false);
        }
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM sync_state WHERE repo_path = ?1 AND collection_name = ?2 AND branch = ?3",
                params![repo_path, collection, branch],
            )
        })
        .map(|n| n > 0)
    }

    /// Remove every record of a branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn delete_branch_sync_states(&mut self, repo_path: &str, branch: &str) -> Result<usize> {
        if !self.is_initialized() {
            return Ok(0);
        }
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM sync_state WHERE repo_path = ?1 AND branch = ?2",
                params![repo_path, branch],
            )
        })
    }

    /// Move a branch's record from `old_name` to `new_name`, replacing any
    /// record already under the new name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn rename_sync_state(&mut self, repo_path: &str, branch: &str, old_name: &str, new_name: &str) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM sync_state WHERE repo_path = ?1 AND branch = ?2 AND collection_name = ?3",
                params![repo_path, branch, new_name],
            )?;
            tx.execute(
                "UPDATE sync_state SET collection_name = ?4
                 WHERE repo_path = ?1 AND branch = ?2 AND collection_name = ?3",
                params![repo_path, branch, old_name, new_name],
            )
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let mut store = StateStore::open_memory().unwrap();
        assert!(store.get_sync_state("/r", "notes", "main").is_none());

        let record = SyncStateRecord::new("/r", "notes", "main").synced(Some("abc".into()), 3, 5);
        store.upsert_sync_state(&record).unwrap();

        let got = store.get_sync_state("/r", "notes", "main").unwrap();
        assert_eq!(got.last_sync_commit.as_deref(), Some("abc"));
        assert_eq!(got.document_count, 3);
        assert_eq!(got.chunk_count, 5);
        assert_eq!(got.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_branch_records_are_isolated() {
        let mut store = StateStore::open_memory().unwrap();
        let main = SyncStateRecord::new("/r", "notes", "main").synced(Some("m1".into()), 2, 2);
        store.upsert_sync_state(&main).unwrap();

        let feature = SyncStateRecord::new("/r", "notes", "feature").synced(Some("f1".into()), 9, 9);
        store.upsert_sync_state(&feature).unwrap();
        let feature = feature.synced(Some("f2".into()), 10, 10);
        store.upsert_sync_state(&feature).unwrap();

        let main_after = store.get_sync_state("/r", "notes", "main").unwrap();
        assert_eq!(main_after.last_sync_commit.as_deref(), Some("m1"));
        assert_eq!(main_after.document_count, 2);
        assert_eq!(store.list_sync_states("/r").len(), 2);
        assert_eq!(store.list_branch_sync_states("/r", "feature").len(), 1);
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let mut store = StateStore::open_memory().unwrap();
        let mut record = SyncStateRecord::new("/r", "notes", "main");
        record.created_at = 42;
        store.upsert_sync_state(&record).unwrap();

        let mut again = SyncStateRecord::new("/r", "notes", "main");
        again.created_at = 99;
        store.upsert_sync_state(&again).unwrap();

        assert_eq!(store.get_sync_state("/r", "notes", "main").unwrap().created_at, 42);
    }

    #[test]
    fn test_rename_and_delete() {
        let mut store = StateStore::open_memory().unwrap();
        store
            .upsert_sync_state(&SyncStateRecord::new("/r", "old", "main"))
            .unwrap();
        store.rename_sync_state("/r", "main", "old", "new").unwrap();
        assert!(store.get_sync_state("/r", "old", "main").is_none());
        assert!(store.get_sync_state("/r", "new", "main").is_some());

        assert!(store.delete_sync_state("/r", "new", "main").unwrap());
        assert!(!store.delete_sync_state("/r", "new", "main").unwrap());
    }
}
