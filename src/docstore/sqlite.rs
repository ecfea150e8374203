//! Embedded SQLite document store.
//!
//! Collections and their entries live in one SQLite file. Documents longer
//! than the chunk size are stored as `<docId>_chunk_<n>` entries; each entry
//! carries `document_id`, `chunk_index`, `total_chunks` and the whole
//! document's `content_hash` in its metadata.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::{debug, warn};

use super::chunking::{chunk_text, ChunkConfig};
use super::{DocumentStore, QueryHit};
use crate::error::{Error, Result};
use crate::model::document::{CHUNK_INDEX, CHUNK_SEPARATOR, CONTENT_HASH, DOCUMENT_ID, TOTAL_CHUNKS};
use crate::model::{CollectionInfo, Metadata, StoreEntry};
use crate::sync::content_hash;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    collection_name TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE ON UPDATE CASCADE,
    id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (collection_name, id)
);

CREATE INDEX IF NOT EXISTS idx_entries_document ON entries(collection_name, document_id);
";

/// Metadata keys this store maintains per entry.
const CHUNK_KEYS: [&str; 4] = [DOCUMENT_ID, CHUNK_INDEX, TOTAL_CHUNKS, CONTENT_HASH];

/// SQLite-backed document store.
#[derive(Debug)]
pub struct SqliteDocumentStore {
    conn: Connection,
    chunking: ChunkConfig,
}

impl SqliteDocumentStore {
    /// Open a store at the given path, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path, chunking: ChunkConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn, chunking)
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ChunkConfig::default())
    }

    fn init(conn: Connection, chunking: ChunkConfig) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, chunking })
    }

    /// Use a different chunk size for subsequent writes.
    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    fn write<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &ChunkConfig) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx, &self.chunking)?;
        tx.commit()?;
        Ok(result)
    }
}

fn require_collection(conn: &Connection, name: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM collections WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(Error::CollectionNotFound {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn parse_metadata(text: &str) -> Metadata {
    serde_json::from_str(text).unwrap_or_else(|e| {
        warn!(error = %e, "Stored metadata is not a JSON object, treating as empty");
        Metadata::new()
    })
}

fn metadata_text(metadata: &Metadata) -> String {
    Value::Object(metadata.clone()).to_string()
}

/// Replace every entry of `doc_id` with freshly chunked content.
fn write_document(
    tx: &Transaction,
    chunking: &ChunkConfig,
    collection: &str,
    doc_id: &str,
    content: &str,
    metadata: &Metadata,
) -> Result<usize> {
    tx.execute(
        "DELETE FROM entries WHERE collection_name = ?1 AND document_id = ?2",
        params![collection, doc_id],
    )?;

    let chunks = chunk_text(content, chunking);
    let total = chunks.len();
    let hash = content_hash(content);
    let mut base = metadata.clone();
    for key in CHUNK_KEYS {
        base.remove(key);
    }

    for (index, chunk) in chunks.iter().enumerate() {
        let entry_id = if total == 1 {
            doc_id.to_string()
        } else {
            format!("{doc_id}{CHUNK_SEPARATOR}{index}")
        };
        let mut md = base.clone();
        md.insert(DOCUMENT_ID.to_string(), Value::from(doc_id));
        md.insert(CHUNK_INDEX.to_string(), Value::from(index));
        md.insert(TOTAL_CHUNKS.to_string(), Value::from(total));
        md.insert(CONTENT_HASH.to_string(), Value::from(hash.clone()));
        tx.execute(
            "INSERT INTO entries (collection_name, id, document_id, chunk_index, content, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![collection, entry_id, doc_id, index, chunk, metadata_text(&md)],
        )?;
    }
    Ok(total)
}

fn read_entries(conn: &Connection, collection: &str, doc_ids: Option<&[String]>) -> Result<Vec<StoreEntry>> {
    let mut sql = String::from(
        "SELECT id, content, metadata FROM entries WHERE collection_name = ?1",
    );
    let mut args: Vec<&str> = vec![collection];
    if let Some(ids) = doc_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (2..=ids.len() + 1).map(|i| format!("?{i}")).collect();
        sql.push_str(&format!(" AND document_id IN ({})", placeholders.join(", ")));
        args.extend(ids.iter().map(String::as_str));
    }
    sql.push_str(" ORDER BY document_id, chunk_index");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, content, metadata) = row?;
        entries.push(StoreEntry {
            id,
            content,
            metadata: parse_metadata(&metadata),
        });
    }
    Ok(entries)
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl DocumentStore for SqliteDocumentStore {
    fn create_collection(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("collection name must not be empty".to_string()));
        }
        let now = chrono::Utc::now().timestamp_millis();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO collections (name, metadata, created_at) VALUES (?1, ?2, ?3)",
            params![name, metadata_text(metadata), now],
        )?;
        if inserted == 0 {
            return Err(Error::DocumentStore(format!("collection '{name}' already exists")));
        }
        debug!(collection = %name, "Created collection");
        Ok(())
    }

    fn delete_collection(&mut self, name: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM collections WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(Error::CollectionNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, metadata FROM collections ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (name, metadata) = row?;
            out.push(CollectionInfo {
                name,
                metadata: parse_metadata(&metadata),
            });
        }
        Ok(out)
    }

    fn collection_exists(&self, name: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM collections WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    fn add_documents(
        &mut self,
        collection: &str,
        contents: &[String],
        ids: &[String],
        metadatas: Option<&[Metadata]>,
    ) -> Result<()> {
        if contents.len() != ids.len() || metadatas.is_some_and(|m| m.len() != ids.len()) {
            return Err(Error::Validation(format!(
                "add_documents: {} ids, {} contents, {} metadatas",
                ids.len(),
                contents.len(),
                metadatas.map_or(ids.len(), <[Metadata]>::len)
            )));
        }
        let empty = Metadata::new();
        self.write(|tx, chunking| {
            require_collection(tx, collection)?;
            for (i, (id, content)) in ids.iter().zip(contents).enumerate() {
                let md = metadatas.map_or(&empty, |m| &m[i]);
                write_document(tx, chunking, collection, id, content, md)?;
            }
            Ok(())
        })
    }

    fn update_documents(
        &mut self,
        collection: &str,
        ids: &[String],
        contents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()> {
        if contents.is_some_and(|c| c.len() != ids.len())
            || metadatas.is_some_and(|m| m.len() != ids.len())
        {
            return Err(Error::Validation(
                "update_documents: ids, contents and metadatas must have equal length".to_string(),
            ));
        }
        self.write(|tx, chunking| {
            require_collection(tx, collection)?;
            for (i, id) in ids.iter().enumerate() {
                let existing = read_entries(tx, collection, Some(std::slice::from_ref(id)))?;
                let Some(first) = existing.first() else {
                    warn!(collection = %collection, id = %id, "Update skipped, document not found");
                    continue;
                };
                let mut md = first.metadata.clone();
                if let Some(patch) = metadatas.map(|m| &m[i]) {
                    for (k, v) in patch {
                        md.insert(k.clone(), v.clone());
                    }
                }
                let content = match contents {
                    Some(c) => c[i].clone(),
                    None => existing.iter().map(|e| e.content.as_str()).collect(),
                };
                write_document(tx, chunking, collection, id, &content, &md)?;
            }
            Ok(())
        })
    }

    fn delete_documents(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        self.write(|tx, _| {
            require_collection(tx, collection)?;
            for id in ids {
                tx.execute(
                    "DELETE FROM entries WHERE collection_name = ?1 AND (document_id = ?2 OR id = ?2)",
                    params![collection, id],
                )?;
            }
            Ok(())
        })
    }

    fn get_documents(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&Metadata>,
    ) -> Result<Vec<StoreEntry>> {
        require_collection(&self.conn, collection)?;
        let mut entries = read_entries(&self.conn, collection, ids)?;
        if let Some(filter) = filter {
            entries.retain(|e| filter.iter().all(|(k, v)| e.metadata.get(k) == Some(v)));
        }
        Ok(entries)
    }

    fn get_document_count(&self, collection: &str) -> Result<usize> {
        require_collection(&self.conn, collection)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE collection_name = ?1",
            [collection],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn query_documents(&self, collection: &str, text: &str, limit: usize) -> Result<Vec<QueryHit>> {
        let query_terms = terms(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        #[allow(clippy::cast_precision_loss)]
        let total = query_terms.len() as f64;

        let mut hits: Vec<QueryHit> = self
            .get_documents(collection, None, None)?
            .into_iter()
            .filter_map(|entry| {
                let entry_terms = terms(&entry.content);
                #[allow(clippy::cast_precision_loss)]
                let matched = query_terms.intersection(&entry_terms).count() as f64;
                (matched > 0.0).then(|| QueryHit {
                    entry,
                    score: matched / total,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn update_collection_metadata(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE collections SET metadata = ?1 WHERE name = ?2",
            params![metadata_text(metadata), name],
        )?;
        if updated == 0 {
            return Err(Error::CollectionNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn rename_collection(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if self.collection_exists(new_name)? {
            return Err(Error::DocumentStore(format!(
                "cannot rename '{old_name}': '{new_name}' already exists"
            )));
        }
        let updated = self.conn.execute(
            "UPDATE collections SET name = ?1 WHERE name = ?2",
            params![new_name, old_name],
        )?;
        if updated == 0 {
            return Err(Error::CollectionNotFound {
                name: old_name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::load_records;
    use crate::model::ChangeFlag;
    use serde_json::json;

    fn md(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn store_with(collection: &str) -> SqliteDocumentStore {
        let mut store = SqliteDocumentStore::open_memory().unwrap();
        store.create_collection(collection, &Metadata::new()).unwrap();
        store
    }

    #[test]
    fn test_collection_lifecycle() {
        let mut store = store_with("notes");
        assert!(store.create_collection("notes", &Metadata::new()).is_err());
        assert!(store.collection_exists("notes").unwrap());

        store.update_collection_metadata("notes", &md(json!({"description": "d"}))).unwrap();
        store.rename_collection("notes", "journal").unwrap();
        let list = store.list_collections().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "journal");
        assert_eq!(list[0].metadata.get("description"), Some(&json!("d")));

        store.delete_collection("journal").unwrap();
        assert!(matches!(
            store.delete_collection("journal"),
            Err(Error::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn test_long_documents_are_chunked_and_regrouped() {
        let mut store = store_with("notes").with_chunking(ChunkConfig::with_max_chars(20));
        let content = "one two three four five six seven eight nine ten".to_string();
        store
            .add_documents("notes", &[content.clone()], &["doc1".into()], None)
            .unwrap();

        let entries = store.get_documents("notes", None, None).unwrap();
        assert!(entries.len() > 1);
        assert!(entries.iter().all(|e| e.id.starts_with("doc1_chunk_")));
        assert_eq!(store.get_document_count("notes").unwrap(), entries.len());

        let records = load_records(&store, "notes").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, content);
        assert_eq!(records[0].content_hash, content_hash(&content));
    }

    #[test]
    fn test_update_merges_metadata_and_rechunks() {
        let mut store = store_with("notes");
        store
            .add_documents(
                "notes",
                &["first".into()],
                &["doc1".into()],
                Some(&[md(json!({"tag": "a"}))]),
            )
            .unwrap();
        store
            .update_documents(
                "notes",
                &["doc1".into(), "missing".into()],
                Some(&["second".into(), "x".into()]),
                Some(&[md(json!({"is_local_change": true})), Metadata::new()]),
            )
            .unwrap();

        let records = load_records(&store, "notes").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "second");
        assert_eq!(records[0].metadata.get("tag"), Some(&json!("a")));
        assert_eq!(records[0].change_flag, ChangeFlag::Dirty);
    }

    #[test]
    fn test_get_documents_by_id_and_filter() {
        let mut store = store_with("notes");
        store
            .add_documents(
                "notes",
                &["a".into(), "b".into()],
                &["d1".into(), "d2".into()],
                Some(&[md(json!({"kind": "x"})), md(json!({"kind": "y"}))]),
            )
            .unwrap();

        let by_id = store.get_documents("notes", Some(&["d2".into()]), None).unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].content, "b");

        let filtered = store
            .get_documents("notes", None, Some(&md(json!({"kind": "x"}))))
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "d1");

        store.delete_documents("notes", &["d1".into()]).unwrap();
        assert_eq!(store.get_document_count("notes").unwrap(), 1);
    }

    #[test]
    fn test_add_rejects_length_mismatch() {
        let mut store = store_with("notes");
        let err = store
            .add_documents("notes", &["a".into()], &["d1".into(), "d2".into()], None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            store.add_documents("missing", &[], &[], None),
            Err(Error::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn test_query_ranks_by_term_overlap() {
        let mut store = store_with("notes");
        store
            .add_documents(
                "notes",
                &["rust sync engine".into(), "sync only".into(), "unrelated".into()],
                &["d1".into(), "d2".into(), "d3".into()],
                None,
            )
            .unwrap();
        let hits = store.query_documents("notes", "Rust sync", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.id, "d1");
        assert!((hits[0].score - 1.0).abs() < f64::EPSILON);
    }
}
