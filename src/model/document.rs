//! Document types and the store-boundary adapters that produce them.
//!
//! The document store hands back raw [`StoreEntry`] values, possibly several
//! chunks per document. [`group_entries`] folds them into one
//! [`DocumentRecord`] per document id. Rows from the versioned store become
//! [`VersionedDocument`] via [`VersionedDocument::from_row`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::content_hash;
use crate::versioned::Row;

/// Free-form metadata attached to documents and collections.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key carrying the local-change flag.
pub const IS_LOCAL_CHANGE: &str = "is_local_change";
/// Metadata key naming the document a chunk belongs to.
pub const DOCUMENT_ID: &str = "document_id";
/// Metadata key with the zero-based chunk position.
pub const CHUNK_INDEX: &str = "chunk_index";
/// Metadata key with the number of chunks in the document.
pub const TOTAL_CHUNKS: &str = "total_chunks";
/// Metadata key with the digest of the whole (unchunked) document.
pub const CONTENT_HASH: &str = "content_hash";
/// Metadata key for the document title.
pub const TITLE: &str = "title";

/// Separator between a document id and its chunk number.
pub const CHUNK_SEPARATOR: &str = "_chunk_";

/// Keys the document store maintains itself. Never part of user metadata.
const INTERNAL_KEYS: [&str; 5] = [IS_LOCAL_CHANGE, DOCUMENT_ID, CHUNK_INDEX, TOTAL_CHUNKS, CONTENT_HASH];

/// Whether a document carries edits not yet staged into the versioned store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFlag {
    #[default]
    Clean,
    Dirty,
}

impl ChangeFlag {
    /// Normalize the `is_local_change` metadata value.
    ///
    /// Accepts booleans, the strings `true`/`1`/`yes` (any case) and non-zero
    /// numbers as dirty. Anything else, including a missing key, is clean.
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        match metadata.get(IS_LOCAL_CHANGE) {
            Some(Value::Bool(true)) => Self::Dirty,
            Some(Value::String(s)) => {
                let s = s.trim().to_ascii_lowercase();
                if matches!(s.as_str(), "true" | "1" | "yes") {
                    Self::Dirty
                } else {
                    Self::Clean
                }
            }
            Some(Value::Number(n)) => {
                if n.as_f64().is_some_and(|v| v != 0.0) {
                    Self::Dirty
                } else {
                    Self::Clean
                }
            }
            _ => Self::Clean,
        }
    }

    #[must_use]
    pub fn is_dirty(self) -> bool {
        self == Self::Dirty
    }

    /// Metadata value written back to the document store.
    #[must_use]
    pub fn as_value(self) -> Value {
        Value::Bool(self.is_dirty())
    }
}

/// A raw entry as stored in the document store (one chunk or whole document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

/// A logical document, reassembled from its entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub collection_name: String,
    pub content: String,
    pub content_hash: String,
    pub title: Option<String>,
    /// User metadata with store bookkeeping keys removed.
    pub metadata: Metadata,
    pub change_flag: ChangeFlag,
    pub chunk_count: usize,
}

/// Document id of an entry id, stripping a `_chunk_<n>` suffix if present.
#[must_use]
pub fn document_id_of(entry_id: &str) -> &str {
    if let Some(pos) = entry_id.rfind(CHUNK_SEPARATOR) {
        let suffix = &entry_id[pos + CHUNK_SEPARATOR.len()..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return &entry_id[..pos];
        }
    }
    entry_id
}

fn chunk_position(entry: &StoreEntry) -> u64 {
    if let Some(idx) = entry.metadata.get(CHUNK_INDEX).and_then(Value::as_u64) {
        return idx;
    }
    entry
        .id
        .rfind(CHUNK_SEPARATOR)
        .and_then(|pos| entry.id[pos + CHUNK_SEPARATOR.len()..].parse().ok())
        .unwrap_or(0)
}

/// Strip store bookkeeping keys, leaving user metadata.
#[must_use]
pub fn user_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter(|(k, _)| !INTERNAL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Fold raw entries into one record per document id, ordered by id.
///
/// Chunks are concatenated in chunk order. A document is dirty if any of its
/// chunks is flagged dirty.
#[must_use]
pub fn group_entries(collection: &str, entries: Vec<StoreEntry>) -> Vec<DocumentRecord> {
    let mut groups: BTreeMap<String, Vec<StoreEntry>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry(document_id_of(&entry.id).to_string())
            .or_default()
            .push(entry);
    }

    groups
        .into_iter()
        .map(|(id, mut chunks)| {
            chunks.sort_by_key(chunk_position);
            let change_flag = if chunks
                .iter()
                .any(|c| ChangeFlag::from_metadata(&c.metadata).is_dirty())
            {
                ChangeFlag::Dirty
            } else {
                ChangeFlag::Clean
            };
            let content: String = chunks.iter().map(|c| c.content.as_str()).collect();
            let metadata = user_metadata(&chunks[0].metadata);
            let title = metadata.get(TITLE).and_then(Value::as_str).map(String::from);

            DocumentRecord {
                content_hash: content_hash(&content),
                collection_name: collection.to_string(),
                chunk_count: chunks.len(),
                id,
                content,
                title,
                metadata,
                change_flag,
            }
        })
        .collect()
}

/// A document row from the versioned store's `documents` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    pub doc_id: String,
    pub collection_name: String,
    pub title: Option<String>,
    pub content: String,
    /// Digest recomputed from `content`; the stored column is not trusted.
    pub content_hash: String,
    pub metadata: Metadata,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl VersionedDocument {
    /// Convert a raw query row.
    ///
    /// Missing columns become empty values. `metadata` may arrive as a JSON
    /// string (TEXT column) or an object.
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        let content = row_string(row, "content").unwrap_or_default();
        Self {
            doc_id: row_string(row, "doc_id").unwrap_or_default(),
            collection_name: row_string(row, "collection_name").unwrap_or_default(),
            title: row_string(row, "title").filter(|t| !t.is_empty()),
            content_hash: content_hash(&content),
            content,
            metadata: row_metadata(row, "metadata"),
            created_at: row_string(row, "created_at"),
            updated_at: row_string(row, "updated_at"),
        }
    }

    /// Metadata as the document store should hold it (title folded in).
    #[must_use]
    pub fn document_metadata(&self) -> Metadata {
        let mut md = self.metadata.clone();
        if let Some(title) = &self.title {
            md.insert(TITLE.to_string(), Value::String(title.clone()));
        }
        md
    }
}

/// Read a column as a string, stringifying numbers.
#[must_use]
pub fn row_string(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read a column as an unsigned count, accepting numbers or numeric strings.
#[must_use]
pub fn row_count(row: &Row, column: &str) -> usize {
    match row.get(column) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f as u64))
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Read a metadata column stored as JSON text or as an object.
#[must_use]
pub fn row_metadata(row: &Row, column: &str) -> Metadata {
    match row.get(column) {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            match serde_json::from_str::<Metadata>(s) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(column, error = %e, "Unparseable metadata column, treating as empty");
                    Metadata::new()
                }
            }
        }
        _ => Metadata::new(),
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
    fn test_change_flag_encodings() {
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": true}))), ChangeFlag::Dirty);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": "True"}))), ChangeFlag::Dirty);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": "1"}))), ChangeFlag::Dirty);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": 1}))), ChangeFlag::Dirty);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": "false"}))), ChangeFlag::Clean);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({"is_local_change": false}))), ChangeFlag::Clean);
        assert_eq!(ChangeFlag::from_metadata(&md(json!({}))), ChangeFlag::Clean);
    }

    #[test]
    fn test_document_id_of() {
        assert_eq!(document_id_of("doc1_chunk_0"), "doc1");
        assert_eq!(document_id_of("doc1_chunk_12"), "doc1");
        assert_eq!(document_id_of("doc1"), "doc1");
        assert_eq!(document_id_of("doc1_chunk_x"), "doc1_chunk_x");
        assert_eq!(document_id_of("a_chunk_b_chunk_3"), "a_chunk_b");
    }

    #[test]
    fn test_group_entries_reassembles_chunks_in_order() {
        let entries = vec![
            StoreEntry {
                id: "doc1_chunk_1".into(),
                content: "world".into(),
                metadata: md(json!({"chunk_index": 1, "title": "Greeting"})),
            },
            StoreEntry {
                id: "doc1_chunk_0".into(),
                content: "hello ".into(),
                metadata: md(json!({"chunk_index": 0, "title": "Greeting", "is_local_change": "true"})),
            },
            StoreEntry {
                id: "doc2".into(),
                content: "solo".into(),
                metadata: Metadata::new(),
            },
        ];

        let docs = group_entries("notes", entries);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "doc1");
        assert_eq!(docs[0].content, "hello world");
        assert_eq!(docs[0].chunk_count, 2);
        assert_eq!(docs[0].change_flag, ChangeFlag::Dirty);
        assert_eq!(docs[0].title.as_deref(), Some("Greeting"));
        assert!(!docs[0].metadata.contains_key("chunk_index"));
        assert_eq!(docs[0].content_hash, content_hash("hello world"));
        assert_eq!(docs[1].change_flag, ChangeFlag::Clean);
    }

    #[test]
    fn test_versioned_document_from_row() {
        let row = md(json!({
            "doc_id": "doc1",
            "collection_name": "notes",
            "title": "T",
            "content": "body",
            "content_hash": "stale",
            "metadata": "{\"tag\":\"x\"}",
        }));
        let doc = VersionedDocument::from_row(&row);
        assert_eq!(doc.content_hash, content_hash("body"));
        assert_eq!(doc.metadata.get("tag"), Some(&json!("x")));
        assert_eq!(doc.document_metadata().get("title"), Some(&json!("T")));
    }

    #[test]
    fn test_row_count_accepts_strings() {
        let row = md(json!({"a": 3, "b": "7", "c": null}));
        assert_eq!(row_count(&row, "a"), 3);
        assert_eq!(row_count(&row, "b"), 7);
        assert_eq!(row_count(&row, "c"), 0);
    }
}
