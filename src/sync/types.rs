//! Derived change sets and operation reports.
//!
//! Nothing here is persisted. Change sets are recomputed on demand from the
//! two stores plus tracked records; reports describe what a staging,
//! reconciliation or full-sync pass actually did.

use serde::Serialize;

use crate::model::{DocumentRecord, Metadata};

/// Document-level changes of one collection not yet in the versioned store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalChangeSet {
    pub collection: String,
    pub new_documents: Vec<DocumentRecord>,
    pub modified_documents: Vec<DocumentRecord>,
    /// Ids present in the versioned store but gone from the document store.
    pub deleted_documents: Vec<String>,
}

impl LocalChangeSet {
    #[must_use]
    pub fn empty(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn total_changes(&self) -> usize {
        self.new_documents.len() + self.modified_documents.len() + self.deleted_documents.len()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Ids only, for display.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            collection: self.collection.clone(),
            new: self.new_documents.iter().map(|d| d.id.clone()).collect(),
            modified: self.modified_documents.iter().map(|d| d.id.clone()).collect(),
            deleted: self.deleted_documents.clone(),
            total: self.total_changes(),
        }
    }
}

/// Id-level view of a [`LocalChangeSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub collection: String,
    pub new: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub total: usize,
}

/// A collection to delete from the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedCollection {
    pub name: String,
    /// `false` when the deletion was inferred (collection vanished from the
    /// document store without being tracked).
    pub tracked: bool,
}

/// A collection rename to replay in the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenamedCollection {
    pub old_name: String,
    pub new_name: String,
}

/// A collection whose metadata differs from the versioned store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatedCollection {
    pub name: String,
    pub metadata: Metadata,
}

/// Collection-level changes not yet in the versioned store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionChangeSet {
    pub deleted: Vec<DeletedCollection>,
    pub renamed: Vec<RenamedCollection>,
    pub updated: Vec<UpdatedCollection>,
}

impl CollectionChangeSet {
    #[must_use]
    pub fn total_changes(&self) -> usize {
        self.deleted.len() + self.renamed.len() + self.updated.len()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    #[must_use]
    pub fn is_deleted(&self, name: &str) -> bool {
        self.deleted.iter().any(|d| d.name == name)
    }
}

/// Result of staging one collection's document changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub collection: String,
    /// A `collections` row was written for a collection new to the
    /// versioned store.
    pub collection_created: bool,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl StageReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted + usize::from(self.collection_created)
    }
}

/// Result of staging collection-level changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStageReport {
    /// Deleted collections with the number of document rows removed.
    pub deleted: Vec<(String, usize)>,
    pub renamed: Vec<(String, String)>,
    pub updated: Vec<String>,
}

impl CollectionStageReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.deleted.len() + self.renamed.len() + self.updated.len()
    }

    /// Document rows removed by cascading collection deletions.
    #[must_use]
    pub fn documents_deleted(&self) -> usize {
        self.deleted.iter().map(|(_, n)| n).sum()
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub branch: String,
    pub hash: String,
    pub message: String,
    pub collections: Vec<StageReport>,
    pub collection_changes: CollectionStageReport,
}

impl CommitReport {
    #[must_use]
    pub fn documents_changed(&self) -> usize {
        self.collections.iter().map(StageReport::total).sum::<usize>()
            + self.collection_changes.documents_deleted()
    }
}

/// Result of reconciling one collection against a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub collection: String,
    /// The collection had to be created in the document store.
    pub created: bool,
    pub added: usize,
    /// Rewritten because the content hash differed.
    pub updated: usize,
    /// Same content, metadata rewritten.
    pub metadata_updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Dirty documents left in place under the carry policy.
    pub preserved: usize,
}

impl ReconcileReport {
    #[must_use]
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.metadata_updated + self.deleted
    }
}

/// A collection that failed to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionFailure {
    pub collection: String,
    pub error: String,
}

/// Result of a full sync from the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullSyncReport {
    pub collection: String,
    pub branch: String,
    pub created_collection: bool,
    /// Entries removed before the fresh load.
    pub cleared: usize,
    pub added: usize,
    pub commit: Option<String>,
}
