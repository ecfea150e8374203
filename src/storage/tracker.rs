//! Tracked collection-level mutations awaiting staging.
//!
//! Deletions (per document or whole collection), renames and metadata
//! updates are recorded here when they are made in the document store, so
//! the next commit can replay them into the versioned store. Records are
//! removed only by [`StateStore::clear_pending`] after that commit succeeds,
//! which keeps a retried commit idempotent.

use rusqlite::{params, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StateStore;
use crate::error::Result;
use crate::model::Metadata;

/// A tracked deletion. `doc_id` is `None` for a whole-collection deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub id: i64,
    pub repo_path: String,
    pub collection_name: String,
    pub doc_id: Option<String>,
    pub original_metadata: Option<Metadata>,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub created_at: i64,
}

impl PendingDeletion {
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.doc_id.is_none()
    }
}

/// A tracked collection rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRename {
    pub id: i64,
    pub repo_path: String,
    pub old_name: String,
    pub new_name: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub created_at: i64,
}

/// A tracked collection metadata update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub id: i64,
    pub repo_path: String,
    pub collection_name: String,
    pub old_metadata: Metadata,
    pub new_metadata: Metadata,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub created_at: i64,
}

fn metadata_text(metadata: &Metadata) -> String {
    Value::Object(metadata.clone()).to_string()
}

fn parse_metadata(text: Option<String>) -> Option<Metadata> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn map_deletion(row: &Row) -> rusqlite::Result<PendingDeletion> {
    Ok(PendingDeletion {
        id: row.get(0)?,
        repo_path: row.get(1)?,
        collection_name: row.get(2)?,
        doc_id: row.get(3)?,
        original_metadata: parse_metadata(row.get(4)?),
        branch: row.get(5)?,
        commit_hash: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_rename(row: &Row) -> rusqlite::Result<PendingRename> {
    Ok(PendingRename {
        id: row.get(0)?,
        repo_path: row.get(1)?,
        old_name: row.get(2)?,
        new_name: row.get(3)?,
        branch: row.get(4)?,
        commit_hash: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_update(row: &Row) -> rusqlite::Result<PendingUpdate> {
    Ok(PendingUpdate {
        id: row.get(0)?,
        repo_path: row.get(1)?,
        collection_name: row.get(2)?,
        old_metadata: parse_metadata(row.get(3)?).unwrap_or_default(),
        new_metadata: parse_metadata(row.get(4)?).unwrap_or_default(),
        branch: row.get(5)?,
        commit_hash: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn collection_deletion_exists(tx: &Transaction, repo: &str, collection: &str, branch: &str) -> rusqlite::Result<bool> {
    tx.prepare(
        "SELECT 1 FROM pending_deletions
         WHERE repo_path = ?1 AND collection_name = ?2 AND branch = ?3 AND doc_id IS NULL",
    )?
    .exists(params![repo, collection, branch])
}

impl StateStore {
    /// Track deletion of individual documents.
    ///
    /// Ignored when the whole collection is already tracked as deleted; a
    /// document already tracked keeps its original metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn track_document_deletions(
        &mut self,
        repo_path: &str,
        collection: &str,
        branch: &str,
        documents: &[(String, Metadata)],
        commit_hash: Option<&str>,
    ) -> Result<()> {
        self.mutate(|tx| {
            if collection_deletion_exists(tx, repo_path, collection, branch)? {
                return Ok(());
            }
            let created_at = now();
            for (doc_id, metadata) in documents {
                tx.execute(
                    "INSERT INTO pending_deletions
                       (repo_path, collection_name, doc_id, original_metadata, branch, commit_hash, created_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                     WHERE NOT EXISTS (
                       SELECT 1 FROM pending_deletions
                       WHERE repo_path = ?1 AND collection_name = ?2 AND doc_id = ?3 AND branch = ?5
                     )",
                    params![repo_path, collection, doc_id, metadata_text(metadata), branch, commit_hash, created_at],
                )?;
            }
            Ok(())
        })
    }

    /// Track deletion of a whole collection. Supersedes any per-document
    /// deletions tracked for the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn track_collection_deletion(
        &mut self,
        repo_path: &str,
        collection: &str,
        branch: &str,
        metadata: &Metadata,
        commit_hash: Option<&str>,
    ) -> Result<()> {
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM pending_deletions WHERE repo_path = ?1 AND collection_name = ?2 AND branch = ?3",
                params![repo_path, collection, branch],
            )?;
            tx.execute(
                "INSERT INTO pending_deletions
                   (repo_path, collection_name, doc_id, original_metadata, branch, commit_hash, created_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
                params![repo_path, collection, metadata_text(metadata), branch, commit_hash, now()],
            )?;
            Ok(())
        })
    }

    /// Track a collection rename. Chains collapse: renaming `a → b` then
    /// `b → c` leaves one `a → c` record, and renaming back to the original
    /// name drops the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn track_rename(
        &mut self,
        repo_path: &str,
        old_name: &str,
        new_name: &str,
        branch: &str,
        commit_hash: Option<&str>,
    ) -> Result<()> {
        self.mutate(|tx| {
            let collapsed = tx.execute(
                "UPDATE pending_renames SET new_name = ?3
                 WHERE repo_path = ?1 AND branch = ?4 AND new_name = ?2",
                params![repo_path, old_name, new_name, branch],
            )?;
            if collapsed == 0 {
                tx.execute(
                    "INSERT INTO pending_renames (repo_path, old_name, new_name, branch, commit_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![repo_path, old_name, new_name, branch, commit_hash, now()],
                )?;
            }
            tx.execute(
                "DELETE FROM pending_renames WHERE repo_path = ?1 AND branch = ?2 AND old_name = new_name",
                params![repo_path, branch],
            )?;
            Ok(())
        })
    }

    /// Track a collection metadata update. Repeated updates keep the first
    /// recorded `old_metadata` and the latest `new_metadata`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn track_update(
        &mut self,
        repo_path: &str,
        collection: &str,
        branch: &str,
        old_metadata: &Metadata,
        new_metadata: &Metadata,
        commit_hash: Option<&str>,
    ) -> Result<()> {
        self.mutate(|tx| {
            let updated = tx.execute(
                "UPDATE pending_updates SET new_metadata = ?4
                 WHERE repo_path = ?1 AND collection_name = ?2 AND branch = ?3",
                params![repo_path, collection, branch, metadata_text(new_metadata)],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO pending_updates
                       (repo_path, collection_name, old_metadata, new_metadata, branch, commit_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        repo_path,
                        collection,
                        metadata_text(old_metadata),
                        metadata_text(new_metadata),
                        branch,
                        commit_hash,
                        now()
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Every tracked deletion on a branch, oldest first.
    #[must_use]
    pub fn pending_deletions(&self, repo_path: &str, branch: &str) -> Vec<PendingDeletion> {
        self.read("pending_deletions", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, repo_path, collection_name, doc_id, original_metadata, branch, commit_hash, created_at
                 FROM pending_deletions WHERE repo_path = ?1 AND branch = ?2
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![repo_path, branch], map_deletion)?;
            rows.collect()
        })
    }

    /// Document ids tracked as deleted in one collection.
    #[must_use]
    pub fn pending_document_deletions(&self, repo_path: &str, collection: &str, branch: &str) -> Vec<String> {
        self.pending_deletions(repo_path, branch)
            .into_iter()
            .filter(|d| d.collection_name == collection)
            .filter_map(|d| d.doc_id)
            .collect()
    }

    /// Every tracked rename on a branch, oldest first.
    #[must_use]
    pub fn pending_renames(&self, repo_path: &str, branch: &str) -> Vec<PendingRename> {
        self.read("pending_renames", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, repo_path, old_name, new_name, branch, commit_hash, created_at
                 FROM pending_renames WHERE repo_path = ?1 AND branch = ?2
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![repo_path, branch], map_rename)?;
            rows.collect()
        })
    }

    /// Every tracked metadata update on a branch, oldest first.
    #[must_use]
    pub fn pending_updates(&self, repo_path: &str, branch: &str) -> Vec<PendingUpdate> {
        self.read("pending_updates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, repo_path, collection_name, old_metadata, new_metadata, branch, commit_hash, created_at
                 FROM pending_updates WHERE repo_path = ?1 AND branch = ?2
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![repo_path, branch], map_update)?;
            rows.collect()
        })
    }

    /// Whether anything is tracked on a branch.
    #[must_use]
    pub fn has_pending(&self, repo_path: &str, branch: &str) -> bool {
        !self.pending_deletions(repo_path, branch).is_empty()
            || !self.pending_renames(repo_path, branch).is_empty()
            || !self.pending_updates(repo_path, branch).is_empty()
    }

    /// Drop every tracked record of a branch. Run after a successful commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn clear_pending(&mut self, repo_path: &str, branch: &str) -> Result<usize> {
        if !self.is_initialized() {
            return Ok(0);
        }
        self.mutate(|tx| {
            let mut removed = 0;
            for table in ["pending_deletions", "pending_renames", "pending_updates"] {
                removed += tx.execute(
                    &format!("DELETE FROM {table} WHERE repo_path = ?1 AND branch = ?2"),
                    params![repo_path, branch],
                )?;
            }
            Ok(removed)
        })
    }

    /// Move every tracked record from one branch to another.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn rebranch_pending(&mut self, repo_path: &str, from: &str, to: &str) -> Result<usize> {
        if !self.is_initialized() || from == to {
            return Ok(0);
        }
        self.mutate(|tx| {
            let mut moved = 0;
            for table in ["pending_deletions", "pending_renames", "pending_updates"] {
                moved += tx.execute(
                    &format!("UPDATE {table} SET branch = ?3 WHERE repo_path = ?1 AND branch = ?2"),
                    params![repo_path, from, to],
                )?;
            }
            Ok(moved)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn md(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_collection_deletion_supersedes_documents() {
        let mut store = StateStore::open_memory().unwrap();
        store
            .track_document_deletions("/r", "notes", "main", &[("d1".into(), Metadata::new())], None)
            .unwrap();
        store
            .track_collection_deletion("/r", "notes", "main", &md(json!({"k": 1})), Some("h"))
            .unwrap();
        store
            .track_document_deletions("/r", "notes", "main", &[("d2".into(), Metadata::new())], None)
            .unwrap();

        let pending = store.pending_deletions("/r", "main");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_collection());
        assert_eq!(pending[0].original_metadata, Some(md(json!({"k": 1}))));
        assert!(store.pending_document_deletions("/r", "notes", "main").is_empty());
    }

    #[test]
    fn test_document_deletions_are_deduplicated() {
        let mut store = StateStore::open_memory().unwrap();
        let docs = [("d1".to_string(), md(json!({"v": 1})))];
        store.track_document_deletions("/r", "notes", "main", &docs, None).unwrap();
        let again = [("d1".to_string(), md(json!({"v": 2})))];
        store.track_document_deletions("/r", "notes", "main", &again, None).unwrap();

        let pending = store.pending_deletions("/r", "main");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].original_metadata, Some(md(json!({"v": 1}))));
    }

    #[test]
    fn test_rename_chains_collapse() {
        let mut store = StateStore::open_memory().unwrap();
        store.track_rename("/r", "a", "b", "main", None).unwrap();
        store.track_rename("/r", "b", "c", "main", None).unwrap();

        let renames = store.pending_renames("/r", "main");
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].old_name, "a");
        assert_eq!(renames[0].new_name, "c");

        store.track_rename("/r", "c", "a", "main", None).unwrap();
        assert!(store.pending_renames("/r", "main").is_empty());
    }

    #[test]
    fn test_update_keeps_first_old_metadata() {
        let mut store = StateStore::open_memory().unwrap();
        store
            .track_update("/r", "notes", "main", &md(json!({"v": 0})), &md(json!({"v": 1})), None)
            .unwrap();
        store
            .track_update("/r", "notes", "main", &md(json!({"v": 1})), &md(json!({"v": 2})), None)
            .unwrap();

        let updates = store.pending_updates("/r", "main");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].old_metadata, md(json!({"v": 0})));
        assert_eq!(updates[0].new_metadata, md(json!({"v": 2})));
    }

    #[test]
    fn test_clear_and_rebranch_are_branch_scoped() {
        let mut store = StateStore::open_memory().unwrap();
        store.track_rename("/r", "a", "b", "main", None).unwrap();
        store.track_rename("/r", "x", "y", "feature", None).unwrap();

        assert_eq!(store.rebranch_pending("/r", "main", "other").unwrap(), 1);
        assert!(!store.has_pending("/r", "main"));
        assert!(store.has_pending("/r", "other"));

        assert_eq!(store.clear_pending("/r", "other").unwrap(), 1);
        assert!(!store.has_pending("/r", "other"));
        assert!(store.has_pending("/r", "feature"));
    }
}
