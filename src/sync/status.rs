//! Sync status: per-collection counts, pending changes and the recorded
//! baseline for the current branch.

use std::collections::BTreeSet;

use colored::Colorize;
use serde::Serialize;

use super::changes::ChangeDetector;
use super::collections::CollectionChangeDetector;
use super::types::CollectionChangeSet;
use crate::docstore::{load_records, DocumentStore};
use crate::error::Result;
use crate::model::row_count;
use crate::storage::{StateStore, SyncStateRecord};
use crate::versioned::{sql, VersionedStore};

/// Status of one collection on the current branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub in_document_store: bool,
    /// Logical documents in the document store.
    pub local_documents: usize,
    /// Raw entries (chunks) in the document store.
    pub local_entries: usize,
    /// Documents in the versioned store's working set.
    pub versioned_documents: usize,
    pub local_changes: usize,
    pub sync_state: Option<SyncStateRecord>,
}

/// Repository-wide status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub repo_path: String,
    pub branch: String,
    pub head: Option<String>,
    pub working_set_clean: bool,
    pub collections: Vec<CollectionStatus>,
    pub collection_changes: CollectionChangeSet,
    pub tracked_pending: bool,
}

impl StatusReport {
    #[must_use]
    pub fn total_local_changes(&self) -> usize {
        self.collections.iter().map(|c| c.local_changes).sum::<usize>()
            + self.collection_changes.total_changes()
    }
}

/// Gather the status of every collection known to either store.
///
/// # Errors
///
/// Returns an error if either store cannot be read.
pub fn collect_status(
    versioned: &dyn VersionedStore,
    documents: &dyn DocumentStore,
    state: &StateStore,
    repo_path: &str,
) -> Result<StatusReport> {
    let branch = versioned.current_branch()?;
    let head = versioned.head_commit_hash().ok();
    let collection_detector = CollectionChangeDetector::new(versioned, documents, state, repo_path, &branch);
    let collection_changes = collection_detector.detect_collection_changes()?;
    let detector = ChangeDetector::new(versioned, documents, state, repo_path, &branch);

    let local: BTreeSet<String> = documents.list_collections()?.into_iter().map(|c| c.name).collect();
    let mut names = local.clone();
    names.extend(collection_detector.versioned_collections()?.into_keys());

    let dialect = versioned.dialect();
    let mut collections = Vec::new();
    for name in names {
        let in_document_store = local.contains(&name);
        let (local_documents, local_entries) = if in_document_store {
            (
                load_records(documents, &name)?.len(),
                documents.get_document_count(&name)?,
            )
        } else {
            (0, 0)
        };
        let versioned_documents = versioned
            .query(&sql::count_documents(dialect, &name))?
            .first()
            .map_or(0, |row| row_count(row, "n"));
        let local_changes = detector.detect_local_changes(&name)?.total_changes();
        collections.push(CollectionStatus {
            sync_state: state.get_sync_state(repo_path, &name, &branch),
            name,
            in_document_store,
            local_documents,
            local_entries,
            versioned_documents,
            local_changes,
        });
    }

    Ok(StatusReport {
        repo_path: repo_path.to_string(),
        tracked_pending: state.has_pending(repo_path, &branch),
        working_set_clean: versioned.status()?.is_clean(),
        branch,
        head,
        collections,
        collection_changes,
    })
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Print status to stdout in a human-readable format.
pub fn print_status(status: &StatusReport) {
    println!("{}", "Sync Status".bold().underline());
    println!();
    println!("  Repository: {}", status.repo_path);
    println!("  Branch:     {}", status.branch.cyan());
    if let Some(head) = &status.head {
        println!("  HEAD:       {}", short(head));
    }
    if !status.working_set_clean {
        println!("  {}", "Versioned working set has uncommitted rows".yellow());
    }
    println!();

    if status.collections.is_empty() {
        println!("{}", "No collections.".dimmed());
        return;
    }

    println!("{}", "Collections:".blue().bold());
    for c in &status.collections {
        let marker = if c.local_changes > 0 {
            format!("{} change(s)", c.local_changes).as_str().yellow()
        } else if !c.in_document_store {
            "not in document store".dimmed()
        } else {
            "in sync".green()
        };
        println!(
            "  {:<24} {:>5} docs ({} entries), {:>5} versioned  {}",
            c.name, c.local_documents, c.local_entries, c.versioned_documents, marker
        );
        match &c.sync_state {
            Some(record) => println!(
                "  {:<24} last sync {} ({})",
                "",
                record.last_sync_commit.as_deref().map_or("-", short),
                record.sync_status.as_str()
            ),
            None => println!("  {:<24} {}", "", "no sync state on this branch".dimmed()),
        }
    }

    let pending = &status.collection_changes;
    if pending.has_changes() {
        println!();
        println!("{}", "Pending Collection Changes:".yellow().bold());
        for d in &pending.deleted {
            println!("  deleted  {}", d.name);
        }
        for r in &pending.renamed {
            println!("  renamed  {} -> {}", r.old_name, r.new_name);
        }
        for u in &pending.updated {
            println!("  updated  {}", u.name);
        }
    }

    println!();
    let total = status.total_local_changes();
    if total > 0 {
        println!("  {}: {}", "Total".bold(), total);
        println!("{}", "Run 'bsync commit -m <message>' to commit local changes.".dimmed());
    } else {
        println!("{}", "No local changes.".green());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::model::Metadata;
    use crate::versioned::{ensure_schema, SnapshotStore};

    #[test]
    fn test_status_counts_both_stores() {
        let mut versioned = SnapshotStore::open_memory().unwrap();
        versioned.init().unwrap();
        ensure_schema(&mut versioned).unwrap();
        let d = versioned.dialect();
        versioned
            .execute(&sql::upsert_collection(d, "remote_only", &Metadata::new(), None))
            .unwrap();

        let mut documents = SqliteDocumentStore::open_memory().unwrap();
        documents.create_collection("notes", &Metadata::new()).unwrap();
        documents
            .add_documents("notes", &["a".into(), "b".into()], &["d1".into(), "d2".into()], None)
            .unwrap();
        let state = StateStore::open_memory().unwrap();

        let report = collect_status(&versioned, &documents, &state, "/r").unwrap();
        assert_eq!(report.branch, "main");
        assert!(!report.working_set_clean);

        let names: Vec<&str> = report.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["notes", "remote_only"]);
        let notes = &report.collections[0];
        assert_eq!(notes.local_documents, 2);
        assert_eq!(notes.local_changes, 2);
        assert!(notes.sync_state.is_none());
        assert!(!report.collections[1].in_document_store);
        // remote_only vanished from the document store without tracking
        assert_eq!(report.collection_changes.deleted.len(), 1);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
