//! Versioned store collaborator.
//!
//! The versioned store is a branchable, SQL-queryable database (Dolt or the
//! embedded [`SnapshotStore`]). The sync core only talks to it through the
//! [`VersionedStore`] trait.
//!
//! # Submodules
//!
//! - [`dolt`] - Process wrapper around the `dolt` executable
//! - [`snapshot`] - Embedded SQLite-backed store with an in-process commit graph
//! - [`sql`] - Literal quoting and statement builders for the sync tables

pub mod dolt;
pub mod snapshot;
pub mod sql;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use dolt::DoltCli;
pub use snapshot::SnapshotStore;
pub use sql::SqlDialect;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Result of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub success: bool,
    pub hash: String,
}

/// Staged/unstaged state of the working set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub has_staged: bool,
    pub has_unstaged: bool,
}

impl RepoStatus {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.has_staged && !self.has_unstaged
    }
}

/// Result of a real (non-preview) merge into the current branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Source was already contained in the current branch.
    pub up_to_date: bool,
    pub fast_forward: bool,
    /// Tables left with row-level conflicts.
    pub conflicted_tables: Vec<String>,
    /// Hash of the merge commit when one was created.
    pub hash: Option<String>,
    /// A merge is in progress and needs an explicit commit.
    pub pending_commit: bool,
}

/// Operations consumed from the versioned store.
///
/// Mutations take `&mut self`; the core never issues two mutations against
/// the same repository concurrently.
pub trait VersionedStore {
    /// SQL flavor used for literal quoting.
    fn dialect(&self) -> SqlDialect;

    /// Initialize the repository if it does not exist yet.
    fn init(&mut self) -> Result<()>;

    fn current_branch(&self) -> Result<String>;

    /// Resolve a branch name, `HEAD`, or commit hash to a commit hash.
    fn resolve_ref(&self, reference: &str) -> Result<String>;

    fn head_commit_hash(&self) -> Result<String> {
        self.resolve_ref("HEAD")
    }

    fn list_branches(&self) -> Result<Vec<String>>;

    /// Create `name` at `start_point` (defaults to `HEAD`) without switching.
    fn create_branch(&mut self, name: &str, start_point: Option<&str>) -> Result<()>;

    fn delete_branch(&mut self, name: &str, force: bool) -> Result<()>;

    /// Switch to `branch`, creating it from `HEAD` first when `create_new`.
    fn checkout(&mut self, branch: &str, create_new: bool) -> Result<()>;

    /// Run a single mutating statement and return the affected row count.
    fn execute(&mut self, sql: &str) -> Result<usize>;

    /// Run a query against the working set.
    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// All rows of `table` as of a commit, branch, or `HEAD`.
    fn table_rows_at(&self, table: &str, reference: &str) -> Result<Vec<Row>>;

    /// Stage every table.
    fn add_all(&mut self) -> Result<()>;

    fn commit(&mut self, message: &str) -> Result<CommitResult>;

    /// Move `HEAD` to `reference` and discard the working set.
    fn reset_hard(&mut self, reference: &str) -> Result<()>;

    /// Unstage changes, keeping the working set.
    fn reset_soft(&mut self, reference: &str) -> Result<()>;

    fn status(&self) -> Result<RepoStatus>;

    /// Best common ancestor of two refs, if any.
    fn merge_base(&self, left: &str, right: &str) -> Result<Option<String>>;

    /// Merge `source` into the current branch.
    ///
    /// With `no_commit`, a successful three-way merge is left staged for an
    /// explicit [`commit`](Self::commit).
    fn merge(&mut self, source: &str, message: &str, no_commit: bool) -> Result<MergeOutcome>;

    /// Clear the conflict marker for `table`, keeping the current rows.
    fn mark_resolved(&mut self, table: &str) -> Result<()>;
}

/// Forwarding impl so a backend chosen at runtime can drive a generic
/// `SyncManager`.
impl<T: VersionedStore + ?Sized> VersionedStore for Box<T> {
    fn dialect(&self) -> SqlDialect {
        (**self).dialect()
    }
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn current_branch(&self) -> Result<String> {
        (**self).current_branch()
    }
    fn resolve_ref(&self, reference: &str) -> Result<String> {
        (**self).resolve_ref(reference)
    }
    fn head_commit_hash(&self) -> Result<String> {
        (**self).head_commit_hash()
    }
    fn list_branches(&self) -> Result<Vec<String>> {
        (**self).list_branches()
    }
    fn create_branch(&mut self, name: &str, start_point: Option<&str>) -> Result<()> {
        (**self).create_branch(name, start_point)
    }
    fn delete_branch(&mut self, name: &str, force: bool) -> Result<()> {
        (**self).delete_branch(name, force)
    }
    fn checkout(&mut self, branch: &str, create_new: bool) -> Result<()> {
        (**self).checkout(branch, create_new)
    }
    fn execute(&mut self, sql: &str) -> Result<usize> {
        (**self).execute(sql)
    }
    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        (**self).query(sql)
    }
    fn table_rows_at(&self, table: &str, reference: &str) -> Result<Vec<Row>> {
        (**self).table_rows_at(table, reference)
    }
    fn add_all(&mut self) -> Result<()> {
        (**self).add_all()
    }
    fn commit(&mut self, message: &str) -> Result<CommitResult> {
        (**self).commit(message)
    }
    fn reset_hard(&mut self, reference: &str) -> Result<()> {
        (**self).reset_hard(reference)
    }
    fn reset_soft(&mut self, reference: &str) -> Result<()> {
        (**self).reset_soft(reference)
    }
    fn status(&self) -> Result<RepoStatus> {
        (**self).status()
    }
    fn merge_base(&self, left: &str, right: &str) -> Result<Option<String>> {
        (**self).merge_base(left, right)
    }
    fn merge(&mut self, source: &str, message: &str, no_commit: bool) -> Result<MergeOutcome> {
        (**self).merge(source, message, no_commit)
    }
    fn mark_resolved(&mut self, table: &str) -> Result<()> {
        (**self).mark_resolved(table)
    }
}

/// Run a query and deserialize each row into `T`.
///
/// # Errors
///
/// Returns an error if the query fails or a row does not match `T`.
pub fn query_as<T: DeserializeOwned>(store: &dyn VersionedStore, sql: &str) -> Result<Vec<T>> {
    store
        .query(sql)?
        .into_iter()
        .map(|row| serde_json::from_value(serde_json::Value::Object(row)).map_err(Into::into))
        .collect()
}

/// Create the sync tables if they are missing.
///
/// # Errors
///
/// Returns an error if a DDL statement fails.
pub fn ensure_schema(store: &mut dyn VersionedStore) -> Result<()> {
    for statement in sql::SCHEMA_STATEMENTS {
        store.execute(statement)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct CountRow {
        n: i64,
    }

    #[test]
    fn test_query_as_deserializes_rows() {
        let mut store = SnapshotStore::open_memory().unwrap();
        store.init().unwrap();
        ensure_schema(&mut store).unwrap();

        let rows: Vec<CountRow> = query_as(&store, "SELECT COUNT(*) AS n FROM documents").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].n, 0);
    }

    #[test]
    fn test_repo_status_clean() {
        assert!(RepoStatus::default().is_clean());
        assert!(!RepoStatus { has_staged: true, has_unstaged: false }.is_clean());
    }
}
