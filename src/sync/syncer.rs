//! Push path: stage document-store changes into the versioned store and
//! commit them.
//!
//! Collection-level changes are staged before document-level ones so that
//! renamed collections are already under their new name when their
//! documents are compared. Local-change flags are cleared only after the
//! versioned store accepted the rows.

use tracing::{debug, info};

use super::changes::{update_sync_state, Baseline, ChangeDetector};
use super::collections::CollectionChangeDetector;
use super::types::{CollectionStageReport, CommitReport, StageReport};
use crate::docstore::{load_records, DocumentStore};
use crate::error::{Error, Result, Step};
use crate::model::document::IS_LOCAL_CHANGE;
use crate::model::{ChangeFlag, Metadata};
use crate::storage::StateStore;
use crate::versioned::{sql, VersionedStore};

/// Stages and commits local changes for one repository.
pub struct Syncer<'a> {
    versioned: &'a mut dyn VersionedStore,
    documents: &'a mut dyn DocumentStore,
    state: &'a mut StateStore,
    repo_path: &'a str,
    embedding_model: Option<&'a str>,
}

impl<'a> Syncer<'a> {
    #[must_use]
    pub fn new(
        versioned: &'a mut dyn VersionedStore,
        documents: &'a mut dyn DocumentStore,
        state: &'a mut StateStore,
        repo_path: &'a str,
    ) -> Self {
        Self {
            versioned,
            documents,
            state,
            repo_path,
            embedding_model: None,
        }
    }

    /// Record `model` as the embedding model on collection rows and sync state.
    #[must_use]
    pub fn with_embedding_model(mut self, model: Option<&'a str>) -> Self {
        self.embedding_model = model;
        self
    }

    /// Write the local changes of `collection` into the working set.
    ///
    /// Does not commit. A collection with no row in the versioned store
    /// gets one, carrying its document-store metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if detection or a write fails. Flags are left set
    /// when the versioned store rejected a write.
    pub fn stage_local_changes(&mut self, collection: &str) -> Result<StageReport> {
        let branch = self.versioned.current_branch()?;
        let changes = ChangeDetector::new(
            &*self.versioned,
            &*self.documents,
            &*self.state,
            self.repo_path,
            &branch,
        )
        .detect_local_changes(collection)?;

        let mut report = StageReport {
            collection: collection.to_string(),
            ..StageReport::default()
        };
        report.collection_created = self.ensure_collection_row(collection)?;
        if !changes.has_changes() {
            return Ok(report);
        }

        let dialect = self.versioned.dialect();
        for doc in changes.new_documents.iter().chain(&changes.modified_documents) {
            self.versioned.execute(&sql::upsert_document(dialect, doc))?;
        }
        if !changes.deleted_documents.is_empty() {
            self.versioned
                .execute(&sql::delete_documents(dialect, collection, &changes.deleted_documents))?;
        }
        report.added = changes.new_documents.len();
        report.modified = changes.modified_documents.len();
        report.deleted = changes.deleted_documents.len();

        let dirty: Vec<String> = changes
            .new_documents
            .iter()
            .chain(&changes.modified_documents)
            .filter(|d| d.change_flag.is_dirty())
            .map(|d| d.id.clone())
            .collect();
        if !dirty.is_empty() {
            let mut clean = Metadata::new();
            clean.insert(IS_LOCAL_CHANGE.to_string(), ChangeFlag::Clean.as_value());
            let metadatas = vec![clean; dirty.len()];
            self.documents
                .update_documents(collection, &dirty, None, Some(&metadatas))?;
        }

        debug!(
            collection,
            added = report.added,
            modified = report.modified,
            deleted = report.deleted,
            "Staged local changes"
        );
        Ok(report)
    }

    /// Insert a `collections` row if the versioned store has none.
    fn ensure_collection_row(&mut self, collection: &str) -> Result<bool> {
        let Some(info) = self
            .documents
            .list_collections()?
            .into_iter()
            .find(|c| c.name == collection)
        else {
            return Ok(false);
        };
        let dialect = self.versioned.dialect();
        let exists = !self
            .versioned
            .query(&format!(
                "SELECT collection_name FROM collections WHERE collection_name = {}",
                dialect.quote(collection)
            ))?
            .is_empty();
        if exists {
            return Ok(false);
        }
        self.versioned.execute(&sql::upsert_collection(
            dialect,
            collection,
            &info.metadata,
            self.embedding_model,
        ))?;
        Ok(true)
    }

    /// Replay collection deletions, renames and metadata updates.
    ///
    /// Deleting a collection removes its document rows first; the count of
    /// removed rows is reported per collection.
    ///
    /// # Errors
    ///
    /// Returns an error if detection or a write fails.
    pub fn stage_collection_changes(&mut self) -> Result<CollectionStageReport> {
        let branch = self.versioned.current_branch()?;
        let changes = CollectionChangeDetector::new(
            &*self.versioned,
            &*self.documents,
            &*self.state,
            self.repo_path,
            &branch,
        )
        .detect_collection_changes()?;

        let dialect = self.versioned.dialect();
        let mut report = CollectionStageReport::default();

        for deleted in &changes.deleted {
            let removed = self
                .versioned
                .execute(&sql::delete_collection_documents(dialect, &deleted.name))?;
            self.versioned
                .execute(&sql::delete_collection(dialect, &deleted.name))?;
            info!(collection = %deleted.name, documents = removed, tracked = deleted.tracked, "Staged collection deletion");
            report.deleted.push((deleted.name.clone(), removed));
        }

        for rename in &changes.renamed {
            for statement in sql::rename_collection(dialect, &rename.old_name, &rename.new_name) {
                self.versioned.execute(&statement)?;
            }
            report
                .renamed
                .push((rename.old_name.clone(), rename.new_name.clone()));
        }

        for update in &changes.updated {
            self.versioned
                .execute(&sql::update_collection_metadata(dialect, &update.name, &update.metadata))?;
            report.updated.push(update.name.clone());
        }

        Ok(report)
    }

    /// Commit on the current branch, staging everything first when
    /// `auto_stage` is set.
    ///
    /// Without `auto_stage` only what is already in the working set is
    /// committed. On success the sync state of every document-store
    /// collection points at the new commit and tracked mutations for the
    /// branch are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChanges`] when nothing was staged and the working
    /// set is clean. I/O failures are tagged with the step they happened in.
    pub fn process_commit(&mut self, message: &str, auto_stage: bool) -> Result<CommitReport> {
        let branch = self.versioned.current_branch().map_err(|e| e.at(Step::Check))?;

        let mut collection_changes = CollectionStageReport::default();
        let mut collections = Vec::new();
        for info in self.documents.list_collections().map_err(|e| e.at(Step::Stage))? {
            collections.push(StageReport {
                collection: info.name,
                ..StageReport::default()
            });
        }
        if auto_stage {
            collection_changes = self
                .stage_collection_changes()
                .map_err(|e| e.at(Step::Stage))?;
            for report in &mut collections {
                *report = self
                    .stage_local_changes(&report.collection)
                    .map_err(|e| e.at(Step::Stage))?;
            }
        }

        let staged = collection_changes.total() + collections.iter().map(StageReport::total).sum::<usize>();
        if staged == 0 && self.versioned.status().map_err(|e| e.at(Step::Check))?.is_clean() {
            return Err(Error::NoChanges);
        }

        self.versioned.add_all().map_err(|e| e.at(Step::Commit))?;
        let commit = self.versioned.commit(message).map_err(|e| e.at(Step::Commit))?;

        for (name, _) in &collection_changes.deleted {
            self.state.delete_sync_state(self.repo_path, name, &branch)?;
        }
        for (old, new) in &collection_changes.renamed {
            self.state.rename_sync_state(self.repo_path, &branch, old, new)?;
        }
        for report in &collections {
            let records = load_records(&*self.documents, &report.collection)?;
            let chunk_count = self.documents.get_document_count(&report.collection)?;
            let baseline = Baseline {
                commit: Some(commit.hash.clone()),
                document_count: records.len(),
                chunk_count,
            };
            update_sync_state(
                self.state,
                self.repo_path,
                &branch,
                &report.collection,
                baseline,
                self.embedding_model,
            )?;
        }
        let cleared = self.state.clear_pending(self.repo_path, &branch)?;

        let report = CommitReport {
            branch: branch.clone(),
            hash: commit.hash,
            message: message.to_string(),
            collections,
            collection_changes,
        };
        info!(
            branch = %branch,
            hash = %report.hash,
            changes = report.documents_changed(),
            tracked_cleared = cleared,
            "Committed local changes"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::model::VersionedDocument;
    use crate::versioned::{ensure_schema, SnapshotStore};
    use serde_json::json;

    struct Fixture {
        versioned: SnapshotStore,
        documents: SqliteDocumentStore,
        state: StateStore,
    }

    impl Fixture {
        fn new() -> Self {
            let mut versioned = SnapshotStore::open_memory().unwrap();
            versioned.init().unwrap();
            ensure_schema(&mut versioned).unwrap();
            Self {
                versioned,
                documents: SqliteDocumentStore::open_memory().unwrap(),
                state: StateStore::open_memory().unwrap(),
            }
        }

        fn syncer(&mut self) -> Syncer<'_> {
            Syncer::new(&mut self.versioned, &mut self.documents, &mut self.state, "/r")
        }

        fn add(&mut self, collection: &str, id: &str, content: &str) {
            if !self.documents.collection_exists(collection).unwrap() {
                self.documents.create_collection(collection, &Metadata::new()).unwrap();
            }
            let md = json!({"is_local_change": true}).as_object().cloned().unwrap();
            self.documents
                .add_documents(collection, &[content.into()], &[id.into()], Some(&[md]))
                .unwrap();
        }

        fn committed(&self, collection: &str) -> Vec<VersionedDocument> {
            self.versioned
                .table_rows_at(sql::DOCUMENTS_TABLE, "HEAD")
                .unwrap()
                .iter()
                .map(VersionedDocument::from_row)
                .filter(|d| d.collection_name == collection)
                .collect()
        }
    }

    #[test]
    fn test_commit_pushes_documents_and_clears_flags() {
        let mut fx = Fixture::new();
        fx.add("notes", "d1", "first");
        fx.add("notes", "d2", "second");

        let report = fx.syncer().process_commit("add notes", true).unwrap();
        assert_eq!(report.collections[0].added, 2);
        assert!(report.collections[0].collection_created);
        assert_eq!(fx.committed("notes").len(), 2);

        let records = load_records(&fx.documents, "notes").unwrap();
        assert!(records.iter().all(|r| !r.change_flag.is_dirty()));

        let state = fx.state.get_sync_state("/r", "notes", "main").unwrap();
        assert_eq!(state.last_sync_commit.as_deref(), Some(report.hash.as_str()));
        assert_eq!(state.document_count, 2);
    }

    #[test]
    fn test_second_commit_without_edits_is_no_changes() {
        let mut fx = Fixture::new();
        fx.add("notes", "d1", "first");
        fx.syncer().process_commit("one", true).unwrap();

        let err = fx.syncer().process_commit("two", true).unwrap_err();
        assert!(matches!(err, Error::NoChanges));
    }

    #[test]
    fn test_collection_deletion_cascades_to_documents() {
        let mut fx = Fixture::new();
        for i in 0..3 {
            fx.add("doomed", &format!("d{i}"), "body");
        }
        fx.syncer().process_commit("seed", true).unwrap();

        fx.documents.delete_collection("doomed").unwrap();
        fx.state
            .track_collection_deletion("/r", "doomed", "main", &Metadata::new(), None)
            .unwrap();

        let report = fx.syncer().process_commit("drop", true).unwrap();
        assert_eq!(report.collection_changes.deleted, vec![("doomed".to_string(), 3)]);
        assert!(fx.committed("doomed").is_empty());
        assert!(fx.state.get_sync_state("/r", "doomed", "main").is_none());
        assert!(!fx.state.has_pending("/r", "main"));
    }

    #[test]
    fn test_rename_moves_rows_and_state() {
        let mut fx = Fixture::new();
        fx.add("old", "d1", "body");
        fx.syncer().process_commit("seed", true).unwrap();

        fx.documents.rename_collection("old", "new").unwrap();
        fx.state.track_rename("/r", "old", "new", "main", None).unwrap();

        let report = fx.syncer().process_commit("rename", true).unwrap();
        assert_eq!(report.collection_changes.renamed, vec![("old".to_string(), "new".to_string())]);
        assert!(fx.committed("old").is_empty());
        assert_eq!(fx.committed("new").len(), 1);
        assert!(fx.state.get_sync_state("/r", "new", "main").is_some());
    }

    #[test]
    fn test_document_deletion_is_staged() {
        let mut fx = Fixture::new();
        fx.add("notes", "d1", "one");
        fx.add("notes", "d2", "two");
        fx.syncer().process_commit("seed", true).unwrap();

        fx.documents.delete_documents("notes", &["d1".into()]).unwrap();
        let report = fx.syncer().process_commit("delete", true).unwrap();
        assert_eq!(report.collections[0].deleted, 1);
        let ids: Vec<String> = fx.committed("notes").into_iter().map(|d| d.doc_id).collect();
        assert_eq!(ids, vec!["d2".to_string()]);
    }
}
