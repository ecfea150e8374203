//! Collection types for both stores.

use serde::{Deserialize, Serialize};

use super::document::{row_metadata, row_string, Metadata};
use crate::versioned::Row;

/// A collection as listed by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub metadata: Metadata,
}

/// A row from the versioned store's `collections` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedCollection {
    pub name: String,
    pub description: Option<String>,
    pub embedding_model: Option<String>,
    pub metadata: Metadata,
}

impl VersionedCollection {
    /// Convert a raw `collections` row.
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        Self {
            name: row_string(row, "collection_name").unwrap_or_default(),
            description: row_string(row, "description").filter(|d| !d.is_empty()),
            embedding_model: row_string(row, "embedding_model").filter(|m| !m.is_empty()),
            metadata: row_metadata(row, "metadata"),
        }
    }
}
