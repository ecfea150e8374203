//! Pull path for one collection: rebuild it in the document store from the
//! versioned store's current branch.

use tracing::info;

use super::changes::{update_sync_state, Baseline};
use super::types::FullSyncReport;
use crate::docstore::{load_records, DocumentStore};
use crate::error::Result;
use crate::model::document::IS_LOCAL_CHANGE;
use crate::model::{ChangeFlag, Metadata, VersionedCollection, VersionedDocument};
use crate::storage::StateStore;
use crate::versioned::{sql, VersionedStore};

/// Default number of documents written per document-store call.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Metadata to write for a document loaded from the versioned store.
pub(crate) fn clean_metadata(doc: &VersionedDocument) -> Metadata {
    let mut md = doc.document_metadata();
    md.insert(IS_LOCAL_CHANGE.to_string(), ChangeFlag::Clean.as_value());
    md
}

/// Write `docs` into `collection` as clean documents, `batch_size` at a time.
pub(crate) fn write_documents(
    documents: &mut dyn DocumentStore,
    collection: &str,
    docs: &[&VersionedDocument],
    batch_size: usize,
) -> Result<()> {
    for batch in docs.chunks(batch_size.max(1)) {
        let contents: Vec<String> = batch.iter().map(|d| d.content.clone()).collect();
        let ids: Vec<String> = batch.iter().map(|d| d.doc_id.clone()).collect();
        let metadatas: Vec<Metadata> = batch.iter().map(|d| clean_metadata(d)).collect();
        documents.add_documents(collection, &contents, &ids, Some(&metadatas))?;
    }
    Ok(())
}

/// Full synchronization of a single collection.
pub struct FullSync<'a> {
    versioned: &'a dyn VersionedStore,
    documents: &'a mut dyn DocumentStore,
    state: &'a mut StateStore,
    repo_path: &'a str,
    embedding_model: Option<&'a str>,
    batch_size: usize,
}

impl<'a> FullSync<'a> {
    #[must_use]
    pub fn new(
        versioned: &'a dyn VersionedStore,
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
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: Option<&'a str>) -> Self {
        self.embedding_model = model;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace every entry of `collection` with the versioned store's rows.
    ///
    /// The collection is created if missing. An empty or absent versioned
    /// collection leaves an empty document-store collection behind.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails; the collection may then be
    /// partially loaded and a re-run repairs it.
    pub fn run(&mut self, collection: &str) -> Result<FullSyncReport> {
        let branch = self.versioned.current_branch()?;
        let dialect = self.versioned.dialect();
        let rows = self.versioned.query(&sql::select_documents(dialect, collection))?;
        let docs: Vec<VersionedDocument> = rows.iter().map(VersionedDocument::from_row).collect();
        let collection_metadata = self
            .versioned
            .query(&sql::select_collections())?
            .iter()
            .map(VersionedCollection::from_row)
            .find(|c| c.name == collection)
            .map(|c| c.metadata)
            .unwrap_or_default();

        let mut created_collection = false;
        let mut cleared = 0;
        if self.documents.collection_exists(collection)? {
            let existing: Vec<String> = load_records(&*self.documents, collection)?
                .into_iter()
                .map(|r| r.id)
                .collect();
            cleared = self.documents.get_document_count(collection)?;
            if !existing.is_empty() {
                self.documents.delete_documents(collection, &existing)?;
            }
            self.documents
                .update_collection_metadata(collection, &collection_metadata)?;
        } else {
            self.documents.create_collection(collection, &collection_metadata)?;
            created_collection = true;
        }

        let refs: Vec<&VersionedDocument> = docs.iter().collect();
        write_documents(self.documents, collection, &refs, self.batch_size)?;

        let commit = self.versioned.head_commit_hash().ok();
        let chunk_count = self.documents.get_document_count(collection)?;
        update_sync_state(
            self.state,
            self.repo_path,
            &branch,
            collection,
            Baseline {
                commit: commit.clone(),
                document_count: docs.len(),
                chunk_count,
            },
            self.embedding_model,
        )?;

        info!(collection, branch = %branch, added = docs.len(), cleared, "Full sync completed");
        Ok(FullSyncReport {
            collection: collection.to_string(),
            branch,
            created_collection,
            cleared,
            added: docs.len(),
            commit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::model::DocumentRecord;
    use crate::sync::content_hash;
    use crate::versioned::{ensure_schema, SnapshotStore};
    use serde_json::json;

    fn seeded_store(docs: &[(&str, &str)]) -> SnapshotStore {
        let mut store = SnapshotStore::open_memory().unwrap();
        store.init().unwrap();
        ensure_schema(&mut store).unwrap();
        let d = store.dialect();
        let md = json!({"source": "wiki"}).as_object().cloned().unwrap();
        store
            .execute(&sql::upsert_collection(d, "notes", &md, None))
            .unwrap();
        for (id, content) in docs {
            let record = DocumentRecord {
                id: (*id).into(),
                collection_name: "notes".into(),
                content: (*content).into(),
                content_hash: content_hash(content),
                title: Some(format!("Title {id}")),
                metadata: Metadata::new(),
                change_flag: ChangeFlag::Clean,
                chunk_count: 1,
            };
            store.execute(&sql::upsert_document(d, &record)).unwrap();
        }
        store.add_all().unwrap();
        store.commit("seed").unwrap();
        store
    }

    #[test]
    fn test_full_sync_replaces_stale_entries() {
        let versioned = seeded_store(&[("d1", "one"), ("d2", "two")]);
        let mut documents = SqliteDocumentStore::open_memory().unwrap();
        documents.create_collection("notes", &Metadata::new()).unwrap();
        documents
            .add_documents("notes", &["stale".into()], &["old".into()], None)
            .unwrap();
        let mut state = StateStore::open_memory().unwrap();

        let report = FullSync::new(&versioned, &mut documents, &mut state, "/r")
            .with_batch_size(1)
            .run("notes")
            .unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.cleared, 1);
        assert!(!report.created_collection);

        let records = load_records(&documents, "notes").unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
        assert!(records.iter().all(|r| !r.change_flag.is_dirty()));
        assert_eq!(records[0].title.as_deref(), Some("Title d1"));

        let info = documents.list_collections().unwrap();
        assert_eq!(info[0].metadata.get("source"), Some(&json!("wiki")));

        let state = state.get_sync_state("/r", "notes", "main").unwrap();
        assert_eq!(state.document_count, 2);
        assert_eq!(state.last_sync_commit, report.commit);
    }

    #[test]
    fn test_full_sync_of_empty_collection_creates_it() {
        let versioned = seeded_store(&[]);
        let mut documents = SqliteDocumentStore::open_memory().unwrap();
        let mut state = StateStore::open_memory().unwrap();

        let report = FullSync::new(&versioned, &mut documents, &mut state, "/r")
            .run("notes")
            .unwrap();

        assert_eq!(report.added, 0);
        assert!(report.created_collection);
        assert!(documents.collection_exists("notes").unwrap());
        assert_eq!(documents.get_document_count("notes").unwrap(), 0);
    }
}
