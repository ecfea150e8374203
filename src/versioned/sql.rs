//! SQL text for the versioned store's sync tables.
//!
//! Statements are built as text because the versioned store is reached through
//! a CLI in production. Every value goes through [`SqlDialect::literal`].

use serde_json::Value;

use super::Row;
use crate::model::{DocumentRecord, Metadata};

/// Table holding one row per collection.
pub const COLLECTIONS_TABLE: &str = "collections";
/// Table holding one row per document.
pub const DOCUMENTS_TABLE: &str = "documents";

/// DDL for the sync tables. Valid for both MySQL-flavored and SQLite backends.
pub const SCHEMA_STATEMENTS: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS collections (
        collection_name VARCHAR(255) NOT NULL PRIMARY KEY,
        description TEXT,
        embedding_model VARCHAR(255),
        metadata TEXT,
        created_at VARCHAR(64),
        updated_at VARCHAR(64)
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        doc_id VARCHAR(255) NOT NULL,
        collection_name VARCHAR(255) NOT NULL,
        title TEXT,
        content LONGTEXT,
        content_hash VARCHAR(64),
        metadata TEXT,
        created_at VARCHAR(64),
        updated_at VARCHAR(64),
        PRIMARY KEY (doc_id, collection_name)
    )",
];

/// Fields that change on every write and never count as a merge conflict.
pub const BOOKKEEPING_COLUMNS: [&str; 3] = ["created_at", "updated_at", "content_hash"];

/// Primary key columns per sync table.
#[must_use]
pub fn key_columns(table: &str) -> &'static [&'static str] {
    match table {
        COLLECTIONS_TABLE => &["collection_name"],
        _ => &["doc_id", "collection_name"],
    }
}

/// SQL flavor, which only affects string literal escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Backslash is an escape character (Dolt, MySQL).
    MySql,
    /// Only the quote character needs doubling.
    Sqlite,
}

impl SqlDialect {
    /// Quote a string literal.
    #[must_use]
    pub fn quote(self, s: &str) -> String {
        let escaped = match self {
            Self::MySql => s.replace('\\', "\\\\").replace('\'', "''"),
            Self::Sqlite => s.replace('\'', "''"),
        };
        format!("'{escaped}'")
    }

    /// Render a JSON value as a SQL literal.
    ///
    /// Objects and arrays are stored as their JSON text.
    #[must_use]
    pub fn literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => String::from(if *b { "1" } else { "0" }),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.quote(s),
            other => self.quote(&other.to_string()),
        }
    }

    /// Render an optional string as a SQL literal.
    #[must_use]
    pub fn opt(self, value: Option<&str>) -> String {
        value.map_or_else(|| "NULL".to_string(), |s| self.quote(s))
    }

    /// Render a comma-separated list of quoted strings.
    #[must_use]
    pub fn list<S: AsRef<str>>(self, values: &[S]) -> String {
        values
            .iter()
            .map(|v| self.quote(v.as_ref()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn metadata_text(metadata: &Metadata) -> String {
    Value::Object(metadata.clone()).to_string()
}

/// `SELECT` every document row of a collection.
#[must_use]
pub fn select_documents(d: SqlDialect, collection: &str) -> String {
    format!(
        "SELECT doc_id, collection_name, title, content, content_hash, metadata, created_at, updated_at \
         FROM documents WHERE collection_name = {} ORDER BY doc_id",
        d.quote(collection)
    )
}

/// `SELECT` the ids and content of a collection's documents.
#[must_use]
pub fn select_document_contents(d: SqlDialect, collection: &str) -> String {
    format!(
        "SELECT doc_id, content FROM documents WHERE collection_name = {}",
        d.quote(collection)
    )
}

/// Count the documents of a collection.
#[must_use]
pub fn count_documents(d: SqlDialect, collection: &str) -> String {
    format!(
        "SELECT COUNT(*) AS n FROM documents WHERE collection_name = {}",
        d.quote(collection)
    )
}

/// `SELECT` every collection row.
#[must_use]
pub fn select_collections() -> String {
    "SELECT collection_name, description, embedding_model, metadata, created_at, updated_at \
     FROM collections ORDER BY collection_name"
        .to_string()
}

/// Insert or replace a document row from a document-store record.
///
/// The title travels in its own column and is removed from stored metadata.
#[must_use]
pub fn upsert_document(d: SqlDialect, doc: &DocumentRecord) -> String {
    let mut metadata = doc.metadata.clone();
    metadata.remove(crate::model::document::TITLE);
    let ts = now();
    format!(
        "REPLACE INTO documents (doc_id, collection_name, title, content, content_hash, metadata, created_at, updated_at) \
         VALUES ({}, {}, {}, {}, {}, {}, {}, {})",
        d.quote(&doc.id),
        d.quote(&doc.collection_name),
        d.opt(doc.title.as_deref()),
        d.quote(&doc.content),
        d.quote(&doc.content_hash),
        d.quote(&metadata_text(&metadata)),
        d.quote(&ts),
        d.quote(&ts),
    )
}

/// Delete the listed document ids of a collection.
#[must_use]
pub fn delete_documents(d: SqlDialect, collection: &str, ids: &[String]) -> String {
    format!(
        "DELETE FROM documents WHERE collection_name = {} AND doc_id IN ({})",
        d.quote(collection),
        d.list(ids)
    )
}

/// Delete every document row of a collection.
#[must_use]
pub fn delete_collection_documents(d: SqlDialect, collection: &str) -> String {
    format!(
        "DELETE FROM documents WHERE collection_name = {}",
        d.quote(collection)
    )
}

/// Insert a collection row, replacing any existing one.
#[must_use]
pub fn upsert_collection(
    d: SqlDialect,
    name: &str,
    metadata: &Metadata,
    embedding_model: Option<&str>,
) -> String {
    let description = metadata.get("description").and_then(Value::as_str);
    let ts = now();
    format!(
        "REPLACE INTO collections (collection_name, description, embedding_model, metadata, created_at, updated_at) \
         VALUES ({}, {}, {}, {}, {}, {})",
        d.quote(name),
        d.opt(description),
        d.opt(embedding_model),
        d.quote(&metadata_text(metadata)),
        d.quote(&ts),
        d.quote(&ts),
    )
}

/// Remove a collection row.
#[must_use]
pub fn delete_collection(d: SqlDialect, name: &str) -> String {
    format!(
        "DELETE FROM collections WHERE collection_name = {}",
        d.quote(name)
    )
}

/// Rename statements: the collection row and its documents, in that order.
#[must_use]
pub fn rename_collection(d: SqlDialect, old: &str, new: &str) -> [String; 2] {
    [
        format!(
            "UPDATE collections SET collection_name = {}, updated_at = {} WHERE collection_name = {}",
            d.quote(new),
            d.quote(&now()),
            d.quote(old)
        ),
        format!(
            "UPDATE documents SET collection_name = {} WHERE collection_name = {}",
            d.quote(new),
            d.quote(old)
        ),
    ]
}

/// Patch a collection's metadata in place.
#[must_use]
pub fn update_collection_metadata(d: SqlDialect, name: &str, metadata: &Metadata) -> String {
    let description = metadata.get("description").and_then(Value::as_str);
    format!(
        "UPDATE collections SET metadata = {}, description = {}, updated_at = {} WHERE collection_name = {}",
        d.quote(&metadata_text(metadata)),
        d.opt(description),
        d.quote(&now()),
        d.quote(name)
    )
}

/// Replace a whole row of `table` with the given column values.
#[must_use]
pub fn replace_row(d: SqlDialect, table: &str, row: &Row) -> String {
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let values: Vec<String> = row.values().map(|v| d.literal(v)).collect();
    format!(
        "REPLACE INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    )
}

/// Delete the row of `table` identified by its key columns.
#[must_use]
pub fn delete_row(d: SqlDialect, table: &str, key: &Row) -> String {
    let predicate: Vec<String> = key_columns(table)
        .iter()
        .map(|col| {
            format!(
                "{col} = {}",
                d.literal(key.get(*col).unwrap_or(&Value::Null))
            )
        })
        .collect();
    format!("DELETE FROM {table} WHERE {}", predicate.join(" AND "))
}
