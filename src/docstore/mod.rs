//! Document store collaborator.
//!
//! The document store is a plain, unversioned collection index. The sync
//! core reads raw [`StoreEntry`] values from it and folds them into typed
//! records with [`crate::model::group_entries`].
//!
//! # Submodules
//!
//! - [`chunking`] - Exact, non-overlapping splitting of long documents
//! - [`sqlite`] - Embedded SQLite-backed implementation

pub mod chunking;
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{group_entries, CollectionInfo, DocumentRecord, Metadata, StoreEntry};

pub use sqlite::SqliteDocumentStore;

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub entry: StoreEntry,
    /// Fraction of query terms present in the entry (0.0 - 1.0).
    pub score: f64,
}

/// Operations consumed from the document store.
pub trait DocumentStore {
    /// Create an empty collection. Fails if it already exists.
    fn create_collection(&mut self, name: &str, metadata: &Metadata) -> Result<()>;

    fn delete_collection(&mut self, name: &str) -> Result<()>;

    fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_collections()?.iter().any(|c| c.name == name))
    }

    /// Add documents, replacing any existing document with the same id.
    ///
    /// `contents`, `ids` and `metadatas` (when given) must have equal length.
    fn add_documents(
        &mut self,
        collection: &str,
        contents: &[String],
        ids: &[String],
        metadatas: Option<&[Metadata]>,
    ) -> Result<()>;

    /// Update existing documents. Metadata is merged into what is stored;
    /// new content replaces the old content. Unknown ids are skipped.
    fn update_documents(
        &mut self,
        collection: &str,
        ids: &[String],
        contents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()>;

    /// Delete documents (all of their chunks) by document id.
    fn delete_documents(&mut self, collection: &str, ids: &[String]) -> Result<()>;

    /// Raw entries, optionally restricted to document ids and a metadata
    /// equality filter.
    fn get_documents(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&Metadata>,
    ) -> Result<Vec<StoreEntry>>;

    /// Number of raw entries (chunks) in a collection.
    fn get_document_count(&self, collection: &str) -> Result<usize>;

    /// Rank entries against a free-text query.
    fn query_documents(&self, collection: &str, text: &str, limit: usize) -> Result<Vec<QueryHit>>;

    /// Replace a collection's metadata.
    fn update_collection_metadata(&mut self, name: &str, metadata: &Metadata) -> Result<()>;

    fn rename_collection(&mut self, old_name: &str, new_name: &str) -> Result<()>;
}

/// Every document of a collection as typed records.
///
/// # Errors
///
/// Returns an error if the collection cannot be read.
pub fn load_records(store: &dyn DocumentStore, collection: &str) -> Result<Vec<DocumentRecord>> {
    Ok(group_entries(collection, store.get_documents(collection, None, None)?))
}
