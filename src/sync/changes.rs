//! Local change detection for one collection.
//!
//! Detection is read-only. Flags in the document store are cleared only by
//! the syncer after the versioned store acknowledged the write.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::types::LocalChangeSet;
use crate::docstore::{load_records, DocumentStore};
use crate::error::Result;
use crate::model::VersionedDocument;
use crate::storage::{StateStore, SyncStateRecord};
use crate::versioned::{sql, VersionedStore};

/// Computes the [`LocalChangeSet`] of a collection.
pub struct ChangeDetector<'a> {
    versioned: &'a dyn VersionedStore,
    documents: &'a dyn DocumentStore,
    state: &'a StateStore,
    repo_path: &'a str,
    branch: &'a str,
}

impl<'a> ChangeDetector<'a> {
    #[must_use]
    pub fn new(
        versioned: &'a dyn VersionedStore,
        documents: &'a dyn DocumentStore,
        state: &'a StateStore,
        repo_path: &'a str,
        branch: &'a str,
    ) -> Self {
        Self {
            versioned,
            documents,
            state,
            repo_path,
            branch,
        }
    }

    /// Documents of `collection` in the versioned store's working set, by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn versioned_documents(&self, collection: &str) -> Result<BTreeMap<String, VersionedDocument>> {
        let rows = self
            .versioned
            .query(&sql::select_documents(self.versioned.dialect(), collection))?;
        Ok(rows
            .iter()
            .map(VersionedDocument::from_row)
            .map(|d| (d.doc_id.clone(), d))
            .collect())
    }

    /// Classify every document of `collection` as new, modified or deleted.
    ///
    /// - flagged dirty: modified if the versioned store has the id, else new
    /// - unflagged and absent from the versioned store: new
    /// - unflagged with a different content hash: modified
    /// - in the versioned store but not the document store: deleted
    ///
    /// A collection missing from the document store yields an empty set;
    /// its removal is a collection-level change.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub fn detect_local_changes(&self, collection: &str) -> Result<LocalChangeSet> {
        let mut changes = LocalChangeSet::empty(collection);
        if !self.documents.collection_exists(collection)? {
            return Ok(changes);
        }

        let records = load_records(self.documents, collection)?;
        let versioned = self.versioned_documents(collection)?;

        let mut present = HashSet::new();
        for record in records {
            present.insert(record.id.clone());
            match versioned.get(&record.id) {
                None => changes.new_documents.push(record),
                Some(_) if record.change_flag.is_dirty() => changes.modified_documents.push(record),
                Some(existing) if existing.content_hash != record.content_hash => {
                    changes.modified_documents.push(record);
                }
                Some(_) => {}
            }
        }

        changes.deleted_documents = versioned
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();

        let tracked: HashSet<String> = self
            .state
            .pending_document_deletions(self.repo_path, collection, self.branch)
            .into_iter()
            .collect();
        let untracked_deletions = changes
            .deleted_documents
            .iter()
            .filter(|id| !tracked.contains(*id))
            .count();

        debug!(
            collection,
            new = changes.new_documents.len(),
            modified = changes.modified_documents.len(),
            deleted = changes.deleted_documents.len(),
            untracked_deletions,
            "Detected local changes"
        );
        Ok(changes)
    }
}

/// New baseline for a collection after a stage, commit or reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    pub commit: Option<String>,
    pub document_count: usize,
    pub chunk_count: usize,
}

/// Persist `baseline` as the sync state of `collection` on `branch`.
///
/// # Errors
///
/// Returns an error if the state store cannot be written.
pub fn update_sync_state(
    state: &mut StateStore,
    repo_path: &str,
    branch: &str,
    collection: &str,
    baseline: Baseline,
    embedding_model: Option<&str>,
) -> Result<()> {
    let mut record = state
        .get_sync_state(repo_path, collection, branch)
        .unwrap_or_else(|| SyncStateRecord::new(repo_path, collection, branch))
        .synced(baseline.commit, baseline.document_count, baseline.chunk_count);
    if embedding_model.is_some() {
        record.embedding_model = embedding_model.map(String::from);
    }
    state.upsert_sync_state(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::model::{DocumentRecord, Metadata};
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
            let mut documents = SqliteDocumentStore::open_memory().unwrap();
            documents.create_collection("notes", &Metadata::new()).unwrap();
            Self {
                versioned,
                documents,
                state: StateStore::open_memory().unwrap(),
            }
        }

        fn commit_row(&mut self, id: &str, content: &str) {
            let record = DocumentRecord {
                id: id.into(),
                collection_name: "notes".into(),
                content: content.into(),
                content_hash: crate::sync::content_hash(content),
                title: None,
                metadata: Metadata::new(),
                change_flag: crate::model::ChangeFlag::Clean,
                chunk_count: 1,
            };
            let d = self.versioned.dialect();
            self.versioned.execute(&sql::upsert_document(d, &record)).unwrap();
        }

        fn add(&mut self, id: &str, content: &str, dirty: bool) {
            let md = json!({"is_local_change": dirty}).as_object().cloned().unwrap();
            self.documents
                .add_documents("notes", &[content.into()], &[id.into()], Some(&[md]))
                .unwrap();
        }

        fn detect(&self, collection: &str) -> LocalChangeSet {
            ChangeDetector::new(&self.versioned, &self.documents, &self.state, "/r", "main")
                .detect_local_changes(collection)
                .unwrap()
        }
    }

    #[test]
    fn test_classifies_new_modified_deleted() {
        let mut fx = Fixture::new();
        fx.commit_row("kept", "same");
        fx.commit_row("edited", "before");
        fx.commit_row("gone", "bye");

        fx.add("kept", "same", false);
        fx.add("edited", "after", true);
        fx.add("fresh", "hello", true);

        let changes = fx.detect("notes");
        assert_eq!(changes.summary().new, vec!["fresh".to_string()]);
        assert_eq!(changes.summary().modified, vec!["edited".to_string()]);
        assert_eq!(changes.deleted_documents, vec!["gone".to_string()]);
        assert_eq!(changes.total_changes(), 3);
    }

    #[test]
    fn test_unflagged_side_channel_insert_is_new() {
        let mut fx = Fixture::new();
        fx.add("sneaky", "inserted without flag", false);
        let changes = fx.detect("notes");
        assert_eq!(changes.new_documents.len(), 1);
    }

    #[test]
    fn test_clean_matching_documents_have_no_changes() {
        let mut fx = Fixture::new();
        fx.commit_row("d1", "body");
        fx.add("d1", "body", false);
        assert!(!fx.detect("notes").has_changes());
    }

    #[test]
    fn test_missing_collection_yields_empty_set() {
        let fx = Fixture::new();
        let changes = fx.detect("absent");
        assert!(!changes.has_changes());
        assert_eq!(changes.collection, "absent");
    }

    #[test]
    fn test_update_sync_state_keeps_model_when_unset() {
        let mut state = StateStore::open_memory().unwrap();
        let baseline = Baseline {
            commit: Some("c1".into()),
            document_count: 2,
            chunk_count: 3,
        };
        update_sync_state(&mut state, "/r", "main", "notes", baseline.clone(), Some("m")).unwrap();
        update_sync_state(&mut state, "/r", "main", "notes", baseline, None).unwrap();

        let record = state.get_sync_state("/r", "notes", "main").unwrap();
        assert_eq!(record.embedding_model.as_deref(), Some("m"));
        assert_eq!(record.chunk_count, 3);
    }
}
