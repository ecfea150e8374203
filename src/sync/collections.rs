//! Collection-level change detection.
//!
//! Precedence, highest first:
//! 1. tracked deletion
//! 2. tracked rename
//! 3. metadata mismatch or tracked metadata update
//! 4. collection only in the versioned store with nothing tracked
//!    (deleted out of band)
//!
//! A name that is both renamed and deleted is deleted under both names.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::types::{CollectionChangeSet, DeletedCollection, RenamedCollection, UpdatedCollection};
use crate::docstore::DocumentStore;
use crate::error::Result;
use crate::model::{Metadata, VersionedCollection};
use crate::storage::StateStore;
use crate::versioned::{sql, VersionedStore};

/// Computes the [`CollectionChangeSet`] for the current branch.
pub struct CollectionChangeDetector<'a> {
    versioned: &'a dyn VersionedStore,
    documents: &'a dyn DocumentStore,
    state: &'a StateStore,
    repo_path: &'a str,
    branch: &'a str,
}

impl<'a> CollectionChangeDetector<'a> {
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

    /// Collections in the versioned store's working set, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn versioned_collections(&self) -> Result<BTreeMap<String, VersionedCollection>> {
        Ok(self
            .versioned
            .query(&sql::select_collections())?
            .iter()
            .map(VersionedCollection::from_row)
            .map(|c| (c.name.clone(), c))
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub fn detect_collection_changes(&self) -> Result<CollectionChangeSet> {
        let local: BTreeMap<String, Metadata> = self
            .documents
            .list_collections()?
            .into_iter()
            .map(|c| (c.name, c.metadata))
            .collect();
        let versioned = self.versioned_collections()?;

        let mut deleted: BTreeMap<String, bool> = self
            .state
            .pending_deletions(self.repo_path, self.branch)
            .into_iter()
            .filter(|d| d.is_collection())
            .map(|d| (d.collection_name, true))
            .collect();

        // Renames touching a deleted name are deletions of both names.
        let mut renamed = Vec::new();
        for rename in self.state.pending_renames(self.repo_path, self.branch) {
            if deleted.contains_key(&rename.old_name) || deleted.contains_key(&rename.new_name) {
                deleted.insert(rename.old_name, true);
                deleted.insert(rename.new_name, true);
            } else if versioned.contains_key(&rename.old_name) {
                renamed.push(RenamedCollection {
                    old_name: rename.old_name,
                    new_name: rename.new_name,
                });
            }
        }

        // Names as the versioned store will know them once renames apply.
        let renamed_away: BTreeSet<&str> = renamed.iter().map(|r| r.old_name.as_str()).collect();
        let committed_name = |name: &str| -> Option<String> {
            if let Some(r) = renamed.iter().find(|r| r.new_name == name) {
                return Some(r.old_name.clone());
            }
            (versioned.contains_key(name) && !renamed_away.contains(name)).then(|| name.to_string())
        };

        let tracked_updates: BTreeMap<String, Metadata> = self
            .state
            .pending_updates(self.repo_path, self.branch)
            .into_iter()
            .map(|u| (u.collection_name, u.new_metadata))
            .collect();

        let mut updated = Vec::new();
        for (name, metadata) in &local {
            if deleted.contains_key(name) {
                continue;
            }
            let Some(source) = committed_name(name) else {
                continue;
            };
            let differs = versioned
                .get(&source)
                .is_some_and(|c| &c.metadata != metadata);
            if differs || tracked_updates.contains_key(name) {
                updated.push(UpdatedCollection {
                    name: name.clone(),
                    metadata: metadata.clone(),
                });
            }
        }

        for name in versioned.keys() {
            let still_local = local.contains_key(name) || renamed_away.contains(name.as_str());
            if !still_local && !deleted.contains_key(name) {
                deleted.insert(name.clone(), false);
            }
        }

        let changes = CollectionChangeSet {
            deleted: deleted
                .into_iter()
                .map(|(name, tracked)| DeletedCollection { name, tracked })
                .collect(),
            renamed,
            updated,
        };
        debug!(
            deleted = changes.deleted.len(),
            renamed = changes.renamed.len(),
            updated = changes.updated.len(),
            "Detected collection changes"
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::versioned::{ensure_schema, SnapshotStore};
    use serde_json::json;

    fn md(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

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

        /// Collection present in both stores with the same metadata.
        fn both(&mut self, name: &str, metadata: &Metadata) {
            let d = self.versioned.dialect();
            self.versioned
                .execute(&sql::upsert_collection(d, name, metadata, None))
                .unwrap();
            self.documents.create_collection(name, metadata).unwrap();
        }

        fn detect(&self) -> CollectionChangeSet {
            CollectionChangeDetector::new(&self.versioned, &self.documents, &self.state, "/r", "main")
                .detect_collection_changes()
                .unwrap()
        }
    }

    #[test]
    fn test_in_sync_collections_have_no_changes() {
        let mut fx = Fixture::new();
        fx.both("notes", &md(json!({"description": "n"})));
        assert!(!fx.detect().has_changes());
    }

    #[test]
    fn test_untracked_disappearance_is_implicit_deletion() {
        let mut fx = Fixture::new();
        fx.both("notes", &Metadata::new());
        fx.documents.delete_collection("notes").unwrap();

        let changes = fx.detect();
        assert_eq!(
            changes.deleted,
            vec![DeletedCollection {
                name: "notes".into(),
                tracked: false
            }]
        );
    }

    #[test]
    fn test_rename_and_metadata_update() {
        let mut fx = Fixture::new();
        fx.both("old", &md(json!({"v": 1})));
        fx.documents.rename_collection("old", "new").unwrap();
        fx.documents.update_collection_metadata("new", &md(json!({"v": 2}))).unwrap();
        fx.state.track_rename("/r", "old", "new", "main", None).unwrap();

        let changes = fx.detect();
        assert!(changes.deleted.is_empty());
        assert_eq!(changes.renamed.len(), 1);
        assert_eq!(changes.renamed[0].new_name, "new");
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].name, "new");
    }

    #[test]
    fn test_deletion_beats_rename_under_both_names() {
        let mut fx = Fixture::new();
        fx.both("a", &Metadata::new());
        fx.documents.rename_collection("a", "b").unwrap();
        fx.state.track_rename("/r", "a", "b", "main", None).unwrap();
        fx.documents.delete_collection("b").unwrap();
        fx.state
            .track_collection_deletion("/r", "b", "main", &Metadata::new(), None)
            .unwrap();

        let changes = fx.detect();
        assert!(changes.renamed.is_empty());
        assert!(changes.is_deleted("a"));
        assert!(changes.is_deleted("b"));
        assert!(changes.deleted.iter().all(|d| d.tracked));
    }

    #[test]
    fn test_tracked_update_without_mismatch_is_reported() {
        let mut fx = Fixture::new();
        fx.both("notes", &md(json!({"v": 1})));
        fx.state
            .track_update("/r", "notes", "main", &md(json!({"v": 1})), &md(json!({"v": 1})), None)
            .unwrap();
        assert_eq!(fx.detect().updated.len(), 1);
    }
}
