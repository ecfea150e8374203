//! Branch switching with document-store reconciliation.
//!
//! A checkout walks a small state machine:
//!
//! ```text
//! Idle -> Checking -+-> Aborted
//!                   +-> StagingFirst ---+
//!                   +-> Carrying -------+-> SwitchingBranch -> Reconciling -> Completed | Failed
//!                   +-> ResettingFirst -+
//!                   +-------------------+
//! ```
//!
//! Every visited state is recorded in the [`CheckoutReport`]. After the
//! versioned store switched branches, each collection is reconciled on its
//! own; one failing collection never stops the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::changes::{update_sync_state, Baseline, ChangeDetector};
use super::collections::CollectionChangeDetector;
use super::full_sync::{write_documents, DEFAULT_BATCH_SIZE};
use super::syncer::Syncer;
use super::types::{CollectionFailure, ReconcileReport};
use crate::docstore::{load_records, DocumentStore};
use crate::error::{Error, Result, Step};
use crate::model::document::IS_LOCAL_CHANGE;
use crate::model::{ChangeFlag, Metadata, VersionedCollection, VersionedDocument};
use crate::storage::StateStore;
use crate::versioned::{sql, VersionedStore};

/// What to do with uncommitted local changes when switching branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPolicy {
    /// Refuse to switch.
    #[default]
    Abort,
    /// Commit them on the current branch, then switch.
    CommitFirst,
    /// Keep uncommitted edits in the document store across the switch.
    Carry,
    /// Discard them, restoring the current branch's committed content.
    ResetFirst,
}

impl CheckoutPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::CommitFirst => "commit_first",
            Self::Carry => "carry",
            Self::ResetFirst => "reset_first",
        }
    }
}

impl fmt::Display for CheckoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the checkout state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    Idle,
    Checking,
    Aborted,
    StagingFirst,
    Carrying,
    ResettingFirst,
    SwitchingBranch,
    Reconciling,
    Completed,
    Failed,
}

/// Parameters of one checkout.
#[derive(Debug, Clone, Copy)]
pub struct CheckoutRequest<'r> {
    pub branch: &'r str,
    pub create_new: bool,
    pub policy: CheckoutPolicy,
    /// Message for the commit made under [`CheckoutPolicy::CommitFirst`].
    pub commit_message: Option<&'r str>,
}

/// Outcome of reconciling every collection against one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePass {
    pub collections: Vec<ReconcileReport>,
    pub failed: Vec<CollectionFailure>,
    /// Document-store collections that do not exist on the branch.
    pub removed: Vec<String>,
    /// Collections skipped because the pass was cancelled.
    pub cancelled: Vec<String>,
}

impl ReconcilePass {
    /// Partial-failure error when some, but not all, collections failed.
    #[must_use]
    pub fn partial_failure(&self) -> Option<Error> {
        if self.failed.is_empty() {
            return None;
        }
        Some(Error::ReconciliationPartialFailure {
            failed: self.failed.iter().map(|f| f.collection.clone()).collect(),
            succeeded: self.collections.iter().map(|c| c.collection.clone()).collect(),
        })
    }

    #[must_use]
    pub fn documents_changed(&self) -> usize {
        self.collections.iter().map(ReconcileReport::changed).sum()
    }
}

/// Everything a checkout did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutReport {
    pub from_branch: String,
    pub to_branch: String,
    pub created_branch: bool,
    pub policy: CheckoutPolicy,
    pub transitions: Vec<CheckoutState>,
    /// Local changes found before switching.
    pub local_changes: usize,
    /// Commit made on the old branch under `commit_first`.
    pub pre_commit: Option<String>,
    pub reconcile: ReconcilePass,
    pub head: Option<String>,
}

impl CheckoutReport {
    #[must_use]
    pub fn state(&self) -> CheckoutState {
        self.transitions.last().copied().unwrap_or(CheckoutState::Idle)
    }
}

/// Switches branches and brings the document store in line.
pub struct CheckoutReconciler<'a> {
    versioned: &'a mut dyn VersionedStore,
    documents: &'a mut dyn DocumentStore,
    state: &'a mut StateStore,
    repo_path: &'a str,
    embedding_model: Option<&'a str>,
    batch_size: usize,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> CheckoutReconciler<'a> {
    #[must_use]
    pub fn new(
        versioned: &'a mut dyn VersionedStore,
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
            cancel: None,
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

    /// Stop between collections once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Count uncommitted local changes on `branch`, by collection.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub fn local_changes(&self, branch: &str) -> Result<(usize, Vec<String>)> {
        let mut count = 0;
        let mut touched = BTreeSet::new();

        let collection_changes = CollectionChangeDetector::new(
            &*self.versioned,
            &*self.documents,
            &*self.state,
            self.repo_path,
            branch,
        )
        .detect_collection_changes()?;
        count += collection_changes.total_changes();
        touched.extend(collection_changes.deleted.iter().map(|d| d.name.clone()));
        touched.extend(collection_changes.renamed.iter().map(|r| r.new_name.clone()));
        touched.extend(collection_changes.updated.iter().map(|u| u.name.clone()));

        let detector = ChangeDetector::new(
            &*self.versioned,
            &*self.documents,
            &*self.state,
            self.repo_path,
            branch,
        );
        for info in self.documents.list_collections()? {
            let changes = detector.detect_local_changes(&info.name)?;
            if changes.has_changes() {
                count += changes.total_changes();
                touched.insert(info.name);
            }
        }
        Ok((count, touched.into_iter().collect()))
    }

    /// Run a checkout under `request.policy`.
    ///
    /// # Errors
    ///
    /// - [`Error::LocalChangesExist`] under [`CheckoutPolicy::Abort`]
    /// - any failure before or during the branch switch, tagged with its step
    ///
    /// Per-collection reconciliation failures are reported in the returned
    /// [`ReconcilePass`], not as errors.
    pub fn checkout(&mut self, request: CheckoutRequest<'_>) -> Result<CheckoutReport> {
        let mut transitions = vec![CheckoutState::Idle, CheckoutState::Checking];
        let from = self.versioned.current_branch().map_err(|e| e.at(Step::Check))?;
        let (local_changes, touched) = self.local_changes(&from).map_err(|e| e.at(Step::Check))?;

        let mut pre_commit = None;
        let mut carry = false;
        if local_changes > 0 {
            match request.policy {
                CheckoutPolicy::Abort => {
                    return Err(Error::LocalChangesExist {
                        count: local_changes,
                        collections: touched,
                    });
                }
                CheckoutPolicy::CommitFirst => {
                    transitions.push(CheckoutState::StagingFirst);
                    let message = request.commit_message.map_or_else(
                        || format!("Auto-commit before checkout to {}", request.branch),
                        String::from,
                    );
                    let mut syncer = Syncer::new(
                        &mut *self.versioned,
                        &mut *self.documents,
                        &mut *self.state,
                        self.repo_path,
                    )
                    .with_embedding_model(self.embedding_model);
                    match syncer.process_commit(&message, true) {
                        Ok(report) => pre_commit = Some(report.hash),
                        Err(Error::NoChanges) => {}
                        Err(e) => return Err(e),
                    }
                }
                CheckoutPolicy::Carry => {
                    transitions.push(CheckoutState::Carrying);
                    carry = true;
                }
                CheckoutPolicy::ResetFirst => {
                    transitions.push(CheckoutState::ResettingFirst);
                    self.versioned
                        .reset_hard("HEAD")
                        .map_err(|e| e.at(Step::Check))?;
                    self.state.clear_pending(self.repo_path, &from)?;
                    let pass = self.reconcile(&from, false, false)?;
                    if let Some(err) = pass.partial_failure() {
                        return Err(err.at(Step::Reconcile));
                    }
                }
            }
        }

        transitions.push(CheckoutState::SwitchingBranch);
        self.versioned
            .checkout(request.branch, request.create_new)
            .map_err(|e| e.at(Step::Switch))?;
        if carry {
            let moved = self
                .state
                .rebranch_pending(self.repo_path, &from, request.branch)?;
            debug!(moved, "Carried tracked mutations to the new branch");
        }

        transitions.push(CheckoutState::Reconciling);
        let pass = self.reconcile(request.branch, carry, !request.create_new)?;
        let failed = pass.collections.is_empty() && !pass.failed.is_empty();
        transitions.push(if failed {
            CheckoutState::Failed
        } else {
            CheckoutState::Completed
        });

        let report = CheckoutReport {
            from_branch: from,
            to_branch: request.branch.to_string(),
            created_branch: request.create_new,
            policy: request.policy,
            transitions,
            local_changes,
            pre_commit,
            head: self.versioned.head_commit_hash().ok(),
            reconcile: pass,
        };
        info!(
            from = %report.from_branch,
            to = %report.to_branch,
            policy = %report.policy,
            changed = report.reconcile.documents_changed(),
            failed = report.reconcile.failed.len(),
            "Checkout finished"
        );
        Ok(report)
    }

    /// Reconcile the document store with the working set of `branch`.
    ///
    /// With `preserve_dirty`, local edits carried onto `branch` survive:
    /// documents flagged as local changes and collections holding any of
    /// them are left alone, tracked document deletions are not undone,
    /// collections with a tracked deletion are not recreated, a tracked
    /// rename keeps its new name and a tracked metadata update keeps its
    /// metadata. Without it, stale local-change flags on documents that
    /// already match the branch are cleared. With `record_state`, each
    /// reconciled collection's sync state is updated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the branch's collection list or the
    /// document store's collection list cannot be read.
    pub fn reconcile(&mut self, branch: &str, preserve_dirty: bool, record_state: bool) -> Result<ReconcilePass> {
        let targets = self.target_collections().map_err(|e| e.at(Step::Reconcile))?;
        let carried = if preserve_dirty {
            CarriedChanges::load(&*self.state, self.repo_path, branch)
        } else {
            CarriedChanges::default()
        };
        let head = self.versioned.head_commit_hash().ok();
        let mut pass = ReconcilePass::default();

        for (name, metadata) in &targets {
            let local_name = carried.local_name(name);
            if self.cancelled() {
                pass.cancelled.push(local_name.to_string());
                continue;
            }
            if carried.is_deleted(name) || carried.is_deleted(local_name) {
                debug!(collection = %name, "Keeping carried collection deletion");
                continue;
            }
            match self.reconcile_collection(name, local_name, metadata, preserve_dirty, &carried) {
                Ok((report, document_count)) => {
                    if record_state {
                        self.record_baseline(branch, name, local_name, head.clone(), document_count);
                    }
                    pass.collections.push(report);
                }
                Err(e) => {
                    warn!(collection = %local_name, error = %e, "Collection reconciliation failed");
                    pass.failed.push(CollectionFailure {
                        collection: local_name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let kept: BTreeSet<&str> = targets
            .keys()
            .map(|name| carried.local_name(name))
            .chain(carried.renames.values().map(String::as_str))
            .collect();
        self.remove_absent_collections(&kept, preserve_dirty, &mut pass)
            .map_err(|e| e.at(Step::Reconcile))?;
        Ok(pass)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Record the post-reconcile baseline of `name`, stored under its
    /// versioned name and counted under its document-store name.
    fn record_baseline(
        &mut self,
        branch: &str,
        name: &str,
        local_name: &str,
        commit: Option<String>,
        document_count: usize,
    ) {
        let chunk_count = match self.documents.get_document_count(local_name) {
            Ok(count) => count,
            Err(e) => {
                warn!(collection = %local_name, error = %e, "Could not count entries; sync state not recorded");
                return;
            }
        };
        let baseline = Baseline {
            commit,
            document_count,
            chunk_count,
        };
        if let Err(e) = update_sync_state(
            self.state,
            self.repo_path,
            branch,
            name,
            baseline,
            self.embedding_model,
        ) {
            warn!(collection = %name, error = %e, "Could not record sync state");
        }
    }

    /// Collections on the branch with their metadata, including ones that
    /// only appear through their documents.
    fn target_collections(&self) -> Result<BTreeMap<String, Metadata>> {
        let mut targets: BTreeMap<String, Metadata> = self
            .versioned
            .query(&sql::select_collections())?
            .iter()
            .map(VersionedCollection::from_row)
            .map(|c| (c.name, c.metadata))
            .collect();
        for row in self
            .versioned
            .query("SELECT DISTINCT collection_name FROM documents")?
        {
            if let Some(name) = crate::model::row_string(&row, "collection_name") {
                targets.entry(name).or_default();
            }
        }
        Ok(targets)
    }

    /// Bring document-store collection `local_name` in line with versioned
    /// collection `name`. The two differ only for a carried rename.
    fn reconcile_collection(
        &mut self,
        name: &str,
        local_name: &str,
        metadata: &Metadata,
        preserve_dirty: bool,
        carried: &CarriedChanges,
    ) -> Result<(ReconcileReport, usize)> {
        let mut report = ReconcileReport::new(local_name);

        let current_metadata = self
            .documents
            .list_collections()?
            .into_iter()
            .find(|c| c.name == local_name)
            .map(|c| c.metadata);
        match current_metadata {
            None => {
                self.documents.create_collection(local_name, metadata)?;
                report.created = true;
            }
            Some(existing) if &existing != metadata && !carried.updated_metadata.contains(local_name) => {
                self.documents.update_collection_metadata(local_name, metadata)?;
            }
            Some(_) => {}
        }

        let rows = self
            .versioned
            .query(&sql::select_documents(self.versioned.dialect(), name))?;
        let target: Vec<VersionedDocument> = rows.iter().map(VersionedDocument::from_row).collect();
        let local: HashMap<String, _> = load_records(&*self.documents, local_name)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut writes: Vec<&VersionedDocument> = Vec::new();
        let mut stale_flags = Vec::new();
        for doc in &target {
            match local.get(&doc.doc_id) {
                None if carried.keeps_deletion(name, &doc.doc_id)
                    || carried.keeps_deletion(local_name, &doc.doc_id) =>
                {
                    report.preserved += 1;
                }
                None => {
                    writes.push(doc);
                    report.added += 1;
                }
                Some(record) if preserve_dirty && record.change_flag.is_dirty() => {
                    report.preserved += 1;
                }
                Some(record) if record.content_hash != doc.content_hash => {
                    writes.push(doc);
                    report.updated += 1;
                }
                Some(record) if record.metadata != doc.document_metadata() => {
                    writes.push(doc);
                    report.metadata_updated += 1;
                }
                Some(record) => {
                    if record.change_flag.is_dirty() {
                        stale_flags.push(record.id.clone());
                    }
                    report.unchanged += 1;
                }
            }
        }

        let target_ids: BTreeSet<&str> = target.iter().map(|d| d.doc_id.as_str()).collect();
        let mut deletions = Vec::new();
        for (id, record) in &local {
            if target_ids.contains(id.as_str()) {
                continue;
            }
            if preserve_dirty && record.change_flag.is_dirty() {
                report.preserved += 1;
            } else {
                deletions.push(id.clone());
            }
        }
        deletions.sort();

        for batch in deletions.chunks(self.batch_size) {
            self.documents.delete_documents(local_name, batch)?;
        }
        report.deleted = deletions.len();
        write_documents(self.documents, local_name, &writes, self.batch_size)?;

        if !stale_flags.is_empty() {
            stale_flags.sort();
            let mut clean = Metadata::new();
            clean.insert(IS_LOCAL_CHANGE.to_string(), ChangeFlag::Clean.as_value());
            let metadatas = vec![clean; stale_flags.len()];
            self.documents
                .update_documents(local_name, &stale_flags, None, Some(&metadatas))?;
        }

        debug!(
            collection = local_name,
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            preserved = report.preserved,
            flags_cleared = stale_flags.len(),
            "Reconciled collection"
        );
        Ok((report, target.len()))
    }

    /// Delete document-store collections not in `kept`. A collection that
    /// cannot be inspected or deleted is reported under its own name.
    fn remove_absent_collections(
        &mut self,
        kept: &BTreeSet<&str>,
        preserve_dirty: bool,
        pass: &mut ReconcilePass,
    ) -> Result<()> {
        for info in self.documents.list_collections()? {
            if kept.contains(info.name.as_str()) {
                continue;
            }
            let outcome = if preserve_dirty {
                load_records(&*self.documents, &info.name)
                    .map(|records| records.iter().any(|r| r.change_flag.is_dirty()))
            } else {
                Ok(false)
            };
            let result = match outcome {
                Ok(true) => continue,
                Ok(false) => self.documents.delete_collection(&info.name),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => pass.removed.push(info.name),
                Err(e) => {
                    warn!(collection = %info.name, error = %e, "Could not remove collection absent from branch");
                    pass.failed.push(CollectionFailure {
                        collection: info.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Tracked mutations carried onto a branch under [`CheckoutPolicy::Carry`].
#[derive(Debug, Default)]
struct CarriedChanges {
    deleted_collections: BTreeSet<String>,
    deleted_documents: BTreeMap<String, BTreeSet<String>>,
    /// Versioned name to document-store name.
    renames: BTreeMap<String, String>,
    updated_metadata: BTreeSet<String>,
}

impl CarriedChanges {
    fn load(state: &StateStore, repo_path: &str, branch: &str) -> Self {
        let mut carried = Self::default();
        for deletion in state.pending_deletions(repo_path, branch) {
            match deletion.doc_id {
                Some(id) => {
                    carried
                        .deleted_documents
                        .entry(deletion.collection_name)
                        .or_default()
                        .insert(id);
                }
                None => {
                    carried.deleted_collections.insert(deletion.collection_name);
                }
            }
        }
        carried.renames = state
            .pending_renames(repo_path, branch)
            .into_iter()
            .map(|r| (r.old_name, r.new_name))
            .collect();
        carried.updated_metadata = state
            .pending_updates(repo_path, branch)
            .into_iter()
            .map(|u| u.collection_name)
            .collect();
        carried
    }

    fn local_name<'n>(&'n self, name: &'n str) -> &'n str {
        self.renames.get(name).map_or(name, String::as_str)
    }

    fn is_deleted(&self, name: &str) -> bool {
        self.deleted_collections.contains(name)
    }

    fn keeps_deletion(&self, collection: &str, doc_id: &str) -> bool {
        self.deleted_documents
            .get(collection)
            .is_some_and(|ids| ids.contains(doc_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::versioned::{ensure_schema, SnapshotStore};
    use serde_json::json;

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

        fn write(&mut self, collection: &str, id: &str, content: &str) {
            if !self.documents.collection_exists(collection).unwrap() {
                self.documents.create_collection(collection, &Metadata::new()).unwrap();
            }
            let md = json!({"is_local_change": true}).as_object().cloned().unwrap();
            self.documents
                .add_documents(collection, &[content.into()], &[id.into()], Some(&[md]))
                .unwrap();
        }

        fn commit(&mut self, message: &str) -> String {
            Syncer::new(&mut self.versioned, &mut self.documents, &mut self.state, "/r")
                .process_commit(message, true)
                .unwrap()
                .hash
        }

        fn checkout(&mut self, branch: &str, create_new: bool, policy: CheckoutPolicy) -> Result<CheckoutReport> {
            CheckoutReconciler::new(&mut self.versioned, &mut self.documents, &mut self.state, "/r")
                .with_batch_size(1)
                .checkout(CheckoutRequest {
                    branch,
                    create_new,
                    policy,
                    commit_message: None,
                })
        }

        fn contents(&self, collection: &str) -> Vec<(String, String)> {
            load_records(&self.documents, collection)
                .unwrap()
                .into_iter()
                .map(|r| (r.id, r.content))
                .collect()
        }
    }

    #[test]
    fn test_switch_restores_each_branch_content() {
        let mut fx = Fixture::new();
        fx.write("notes", "doc1", "Original 1");
        fx.write("notes", "doc2", "Original 2");
        fx.commit("main content");

        fx.checkout("feature", true, CheckoutPolicy::Abort).unwrap();
        fx.write("notes", "doc1", "Modified 1");
        fx.write("notes", "doc2", "Modified 2");
        fx.commit("feature content");

        let report = fx.checkout("main", false, CheckoutPolicy::Abort).unwrap();
        assert_eq!(report.state(), CheckoutState::Completed);
        assert_eq!(report.reconcile.collections[0].updated, 2);
        assert_eq!(
            fx.contents("notes"),
            vec![("doc1".into(), "Original 1".into()), ("doc2".into(), "Original 2".into())]
        );

        fx.checkout("feature", false, CheckoutPolicy::Abort).unwrap();
        assert_eq!(
            fx.contents("notes"),
            vec![("doc1".into(), "Modified 1".into()), ("doc2".into(), "Modified 2".into())]
        );
    }

    #[test]
    fn test_branch_local_documents_stay_on_their_branch() {
        let mut fx = Fixture::new();
        fx.write("notes", "shared", "base");
        fx.commit("base");

        fx.checkout("feature", true, CheckoutPolicy::Abort).unwrap();
        fx.write("notes", "feature_only", "new");
        fx.commit("feature doc");

        let report = fx.checkout("main", false, CheckoutPolicy::Abort).unwrap();
        assert_eq!(report.reconcile.collections[0].deleted, 1);
        assert_eq!(fx.contents("notes"), vec![("shared".into(), "base".into())]);
    }

    #[test]
    fn test_abort_policy_leaves_everything_untouched() {
        let mut fx = Fixture::new();
        fx.write("notes", "d1", "committed");
        fx.commit("base");
        fx.versioned.create_branch("other", None).unwrap();
        fx.write("notes", "d1", "edited");

        let err = fx.checkout("other", false, CheckoutPolicy::Abort).unwrap_err();
        assert!(matches!(err, Error::LocalChangesExist { count: 1, .. }));
        assert_eq!(fx.versioned.current_branch().unwrap(), "main");
        assert_eq!(fx.contents("notes"), vec![("d1".into(), "edited".into())]);
    }

    #[test]
    fn test_commit_first_commits_on_old_branch() {
        let mut fx = Fixture::new();
        fx.write("notes", "d1", "committed");
        fx.commit("base");
        fx.versioned.create_branch("other", None).unwrap();
        fx.write("notes", "d1", "edited");

        let report = fx.checkout("other", false, CheckoutPolicy::CommitFirst).unwrap();
        assert!(report.pre_commit.is_some());
        assert!(report.transitions.contains(&CheckoutState::StagingFirst));
        assert_eq!(fx.contents("notes"), vec![("d1".into(), "committed".into())]);

        fx.checkout("main", false, CheckoutPolicy::Abort).unwrap();
        assert_eq!(fx.contents("notes"), vec![("d1".into(), "edited".into())]);
    }

    #[test]
    fn test_carry_keeps_dirty_documents() {
        let mut fx = Fixture::new();
        fx.write("notes", "d1", "committed");
        fx.commit("base");
        fx.versioned.create_branch("other", None).unwrap();
        fx.write("notes", "draft", "unsaved");

        let report = fx.checkout("other", false, CheckoutPolicy::Carry).unwrap();
        assert_eq!(report.reconcile.collections[0].preserved, 1);
        assert_eq!(fx.versioned.current_branch().unwrap(), "other");
        assert_eq!(fx.contents("notes").len(), 2);
    }

    #[test]
    fn test_reset_first_discards_local_edits() {
        let mut fx = Fixture::new();
        fx.write("notes", "d1", "committed");
        fx.commit("base");
        fx.versioned.create_branch("other", None).unwrap();
        fx.write("notes", "d1", "edited");
        fx.write("scratch", "s1", "temp");

        let report = fx.checkout("other", false, CheckoutPolicy::ResetFirst).unwrap();
        assert!(report.transitions.contains(&CheckoutState::ResettingFirst));
        assert_eq!(fx.contents("notes"), vec![("d1".into(), "committed".into())]);
        assert!(!fx.documents.collection_exists("scratch").unwrap());
    }

    #[test]
    fn test_new_branch_has_no_sync_state() {
        let mut fx = Fixture::new();
        fx.write("notes", "d1", "body");
        fx.commit("base");

        let report = fx.checkout("fresh", true, CheckoutPolicy::Abort).unwrap();
        assert!(report.created_branch);
        assert!(fx.state.get_sync_state("/r", "notes", "fresh").is_none());
        assert!(fx.state.get_sync_state("/r", "notes", "main").is_some());
    }

    #[test]
    fn test_cancel_skips_remaining_collections() {
        let mut fx = Fixture::new();
        fx.write("a", "d1", "x");
        fx.write("b", "d2", "y");
        fx.commit("base");

        let flag = AtomicBool::new(true);
        let pass = CheckoutReconciler::new(&mut fx.versioned, &mut fx.documents, &mut fx.state, "/r")
            .with_cancel(&flag)
            .reconcile("main", false, true)
            .unwrap();
        assert_eq!(pass.cancelled, vec!["a".to_string(), "b".to_string()]);
        assert!(pass.collections.is_empty());
    }

    /// Document store that fails writes to, or entry counts of, chosen
    /// collections.
    struct FlakyDocuments<'s> {
        inner: &'s mut SqliteDocumentStore,
        broken_writes: &'s [&'s str],
        broken_counts: &'s [&'s str],
    }

    impl FlakyDocuments<'_> {
        fn check(names: &[&str], collection: &str) -> Result<()> {
            if names.iter().any(|n| *n == collection) {
                return Err(Error::DocumentStore(format!("{collection}: disk unavailable")));
            }
            Ok(())
        }
    }

    impl DocumentStore for FlakyDocuments<'_> {
        fn create_collection(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
            self.inner.create_collection(name, metadata)
        }

        fn delete_collection(&mut self, name: &str) -> Result<()> {
            Self::check(self.broken_writes, name)?;
            self.inner.delete_collection(name)
        }

        fn list_collections(&self) -> Result<Vec<crate::model::CollectionInfo>> {
            self.inner.list_collections()
        }

        fn add_documents(
            &mut self,
            collection: &str,
            contents: &[String],
            ids: &[String],
            metadatas: Option<&[Metadata]>,
        ) -> Result<()> {
            Self::check(self.broken_writes, collection)?;
            self.inner.add_documents(collection, contents, ids, metadatas)
        }

        fn update_documents(
            &mut self,
            collection: &str,
            ids: &[String],
            contents: Option<&[String]>,
            metadatas: Option<&[Metadata]>,
        ) -> Result<()> {
            Self::check(self.broken_writes, collection)?;
            self.inner.update_documents(collection, ids, contents, metadatas)
        }

        fn delete_documents(&mut self, collection: &str, ids: &[String]) -> Result<()> {
            Self::check(self.broken_writes, collection)?;
            self.inner.delete_documents(collection, ids)
        }

        fn get_documents(
            &self,
            collection: &str,
            ids: Option<&[String]>,
            filter: Option<&Metadata>,
        ) -> Result<Vec<crate::model::StoreEntry>> {
            self.inner.get_documents(collection, ids, filter)
        }

        fn get_document_count(&self, collection: &str) -> Result<usize> {
            Self::check(self.broken_counts, collection)?;
            self.inner.get_document_count(collection)
        }

        fn query_documents(&self, collection: &str, text: &str, limit: usize) -> Result<Vec<crate::docstore::QueryHit>> {
            self.inner.query_documents(collection, text, limit)
        }

        fn update_collection_metadata(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
            self.inner.update_collection_metadata(name, metadata)
        }

        fn rename_collection(&mut self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_collection(old_name, new_name)
        }
    }

    /// `main` holds a/d1 and b/d2; `feature` holds edited copies of both.
    fn two_branch_fixture() -> Fixture {
        let mut fx = Fixture::new();
        fx.write("a", "d1", "main a");
        fx.write("b", "d2", "main b");
        fx.commit("main content");
        fx.checkout("feature", true, CheckoutPolicy::Abort).unwrap();
        fx.write("a", "d1", "feature a");
        fx.write("b", "d2", "feature b");
        fx.commit("feature content");
        fx
    }

    fn flaky_checkout(fx: &mut Fixture, branch: &str, broken_writes: &[&str], broken_counts: &[&str]) -> CheckoutReport {
        let mut documents = FlakyDocuments {
            inner: &mut fx.documents,
            broken_writes,
            broken_counts,
        };
        CheckoutReconciler::new(&mut fx.versioned, &mut documents, &mut fx.state, "/r")
            .checkout(CheckoutRequest {
                branch,
                create_new: false,
                policy: CheckoutPolicy::Abort,
                commit_message: None,
            })
            .unwrap()
    }

    #[test]
    fn test_failing_collection_does_not_block_others() {
        let mut fx = two_branch_fixture();

        let report = flaky_checkout(&mut fx, "main", &["b"], &[]);
        assert_eq!(report.state(), CheckoutState::Completed);
        assert_eq!(report.reconcile.collections.len(), 1);
        assert_eq!(report.reconcile.collections[0].collection, "a");
        assert_eq!(report.reconcile.failed.len(), 1);
        assert_eq!(report.reconcile.failed[0].collection, "b");
        assert_eq!(fx.contents("a"), vec![("d1".into(), "main a".into())]);
        assert_eq!(fx.contents("b"), vec![("d2".into(), "feature b".into())]);

        let err = report.reconcile.partial_failure().unwrap();
        assert!(matches!(
            err,
            Error::ReconciliationPartialFailure { ref failed, ref succeeded }
                if failed == &["b".to_string()] && succeeded == &["a".to_string()]
        ));
    }

    #[test]
    fn test_every_collection_failing_is_failed() {
        let mut fx = two_branch_fixture();

        let report = flaky_checkout(&mut fx, "main", &["a", "b"], &[]);
        assert_eq!(report.state(), CheckoutState::Failed);
        assert!(report.reconcile.collections.is_empty());
        let failed: Vec<&str> = report.reconcile.failed.iter().map(|f| f.collection.as_str()).collect();
        assert_eq!(failed, vec!["a", "b"]);
        assert_eq!(fx.versioned.current_branch().unwrap(), "main");
    }

    #[test]
    fn test_failed_removal_names_the_collection() {
        let mut fx = two_branch_fixture();
        fx.write("scratch", "s1", "feature only");
        fx.commit("scratch");

        let report = flaky_checkout(&mut fx, "main", &["scratch"], &[]);
        assert_eq!(report.state(), CheckoutState::Completed);
        assert_eq!(report.reconcile.collections.len(), 2);
        assert_eq!(report.reconcile.failed.len(), 1);
        assert_eq!(report.reconcile.failed[0].collection, "scratch");
        assert!(report.reconcile.removed.is_empty());
    }

    #[test]
    fn test_unreadable_entry_count_skips_sync_state() {
        let mut fx = Fixture::new();
        fx.write("a", "d1", "x");
        fx.write("b", "d2", "y");
        fx.commit("base");
        fx.versioned.create_branch("other", None).unwrap();

        let report = flaky_checkout(&mut fx, "other", &[], &["b"]);
        assert_eq!(report.state(), CheckoutState::Completed);
        assert!(report.reconcile.failed.is_empty());
        assert!(fx.state.get_sync_state("/r", "a", "other").is_some());
        assert!(fx.state.get_sync_state("/r", "b", "other").is_none());
    }
}
