//! Orchestrating facade over both stores and the local sync state.
//!
//! [`SyncManager`] owns one versioned store, one document store and the
//! state store for a single repository path. Expected conditions (nothing
//! to commit, local changes blocking a checkout, unresolved conflicts) come
//! back as outcome enums; only unexpected failures are `Err`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use super::changes::ChangeDetector;
use super::checkout::{CheckoutPolicy, CheckoutReconciler, CheckoutReport, CheckoutRequest, CheckoutState};
use super::collections::CollectionChangeDetector;
use super::full_sync::{FullSync, DEFAULT_BATCH_SIZE};
use super::lock::{acquire, RepoLocks};
use super::merge::{ConflictAnalyzer, ConflictResolution, MergePreview, MergeReport, MergeResolver, ResolutionType};
use super::status::{collect_status, StatusReport};
use super::syncer::Syncer;
use super::types::{ChangeSummary, CollectionChangeSet, CommitReport, FullSyncReport};
use crate::docstore::{load_records, DocumentStore};
use crate::error::{Error, Result, Step};
use crate::model::document::IS_LOCAL_CHANGE;
use crate::model::{row_string, ChangeFlag, Metadata};
use crate::storage::events::{Event, EventType};
use crate::storage::{StateStore, SyncStateRecord};
use crate::validate::{validate_collection_name, validate_doc_id};
use crate::versioned::sql::{COLLECTIONS_TABLE, DOCUMENTS_TABLE};
use crate::versioned::{ensure_schema, VersionedStore};

/// Tunables for a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub checkout_policy: CheckoutPolicy,
    pub merge_default_resolution: ResolutionType,
    pub batch_size: usize,
    pub embedding_model: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkout_policy: CheckoutPolicy::Abort,
            merge_default_resolution: ResolutionType::KeepOurs,
            batch_size: DEFAULT_BATCH_SIZE,
            embedding_model: None,
        }
    }
}

/// A document handed to [`SyncManager::add_documents`].
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct NewDocument {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed(CommitReport),
    NoChanges { branch: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    Completed(CheckoutReport),
    /// Local changes exist and the policy was `abort`. Nothing changed.
    Aborted {
        branch: String,
        target: String,
        local_changes: usize,
        collections: Vec<String>,
    },
    /// The switch happened but no collection reconciled.
    Failed(CheckoutReport),
}

/// Why a merge did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MergeBlock {
    UnresolvedConflicts { conflict_ids: Vec<String> },
    LocalChanges { count: usize, collections: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeResult {
    Merged(MergeReport),
    Blocked(MergeBlock),
}

/// Local changes across collections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalChangesReport {
    pub branch: String,
    pub collections: Vec<ChangeSummary>,
    pub collection_changes: CollectionChangeSet,
    pub total: usize,
}

/// Facade over one repository's stores.
pub struct SyncManager<V: VersionedStore, D: DocumentStore> {
    repo_path: String,
    versioned: V,
    documents: D,
    state: StateStore,
    options: SyncOptions,
    locks: Option<Arc<RepoLocks>>,
    cancel: Arc<AtomicBool>,
}

impl<V: VersionedStore, D: DocumentStore> SyncManager<V, D> {
    pub fn new(repo_path: impl Into<String>, versioned: V, documents: D, state: StateStore) -> Self {
        Self {
            repo_path: repo_path.into(),
            versioned,
            documents,
            state,
            options: SyncOptions::default(),
            locks: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a lock registry so mutating calls on the same repository path
    /// are serialized across managers.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<RepoLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn repo_path(&self) -> &str {
        &self.repo_path
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn versioned(&self) -> &V {
        &self.versioned
    }

    pub fn documents(&self) -> &D {
        &self.documents
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Flag that stops an in-flight reconciliation between collections.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn lock_handle(&self) -> Option<Arc<Mutex<()>>> {
        self.locks.as_ref().map(|l| l.handle(&self.repo_path))
    }

    /// Record an audit event. Failures are logged, never returned.
    fn audit(&mut self, event: Event) {
        if let Err(e) = self.state.record_event(&event) {
            warn!(error = %e, event = event.event_type.as_str(), "Could not record sync event");
        }
    }

    fn current_branch(&self) -> Result<String> {
        self.versioned.current_branch()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Initialize the versioned repository and its sync tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository or schema cannot be created.
    pub fn initialize(&mut self) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        self.versioned.init()?;
        ensure_schema(&mut self.versioned)?;
        if !self.versioned.status()?.is_clean() {
            self.versioned.add_all()?;
            self.versioned.commit("Initialize sync schema")?;
        }
        info!(repo = %self.repo_path, "Repository initialized");
        Ok(())
    }

    // ── Push ──────────────────────────────────────────────────

    /// Stage local changes and commit them on the current branch.
    ///
    /// # Errors
    ///
    /// Returns I/O failures tagged with the step they happened in.
    pub fn process_commit(&mut self, message: &str, auto_stage: bool) -> Result<CommitOutcome> {
        if message.trim().is_empty() {
            return Err(Error::Validation("commit message must not be empty".to_string()));
        }
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        let result = Syncer::new(&mut self.versioned, &mut self.documents, &mut self.state, &self.repo_path)
            .with_embedding_model(self.options.embedding_model.as_deref())
            .process_commit(message, auto_stage);
        match result {
            Ok(report) => {
                self.audit(
                    Event::new(&self.repo_path, &report.branch, EventType::CommitProcessed)
                        .with_commit(Some(&report.hash))
                        .with_comment(&format!("{} change(s)", report.documents_changed())),
                );
                Ok(CommitOutcome::Committed(report))
            }
            Err(Error::NoChanges) => Ok(CommitOutcome::NoChanges {
                branch: self.current_branch()?,
            }),
            Err(e) => Err(e),
        }
    }

    // ── Checkout ──────────────────────────────────────────────

    /// Switch branches and reconcile the document store.
    ///
    /// `policy` overrides the configured default.
    ///
    /// # Errors
    ///
    /// Returns failures before or during the branch switch, tagged with
    /// their step.
    pub fn process_checkout(
        &mut self,
        branch: &str,
        create_new: bool,
        policy: Option<CheckoutPolicy>,
    ) -> Result<CheckoutOutcome> {
        if branch.trim().is_empty() {
            return Err(Error::Validation("branch name must not be empty".to_string()));
        }
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        let policy = policy.unwrap_or(self.options.checkout_policy);
        let from = self.current_branch()?;
        let result = CheckoutReconciler::new(
            &mut self.versioned,
            &mut self.documents,
            &mut self.state,
            &self.repo_path,
        )
        .with_embedding_model(self.options.embedding_model.as_deref())
        .with_batch_size(self.options.batch_size)
        .with_cancel(&self.cancel)
        .checkout(CheckoutRequest {
            branch,
            create_new,
            policy,
            commit_message: None,
        });

        match result {
            Ok(report) => {
                let completed = report.state() == CheckoutState::Completed;
                let event_type = if completed {
                    EventType::CheckoutCompleted
                } else {
                    EventType::CheckoutFailed
                };
                self.audit(
                    Event::new(&self.repo_path, branch, event_type)
                        .with_commit(report.head.as_deref())
                        .with_comment(&format!(
                            "from {} ({}), {} document(s) changed, {} collection(s) failed",
                            report.from_branch,
                            report.policy,
                            report.reconcile.documents_changed(),
                            report.reconcile.failed.len()
                        )),
                );
                if create_new {
                    self.audit(
                        Event::new(&self.repo_path, branch, EventType::BranchCreated)
                            .with_comment(&format!("from {}", report.from_branch)),
                    );
                }
                if completed {
                    Ok(CheckoutOutcome::Completed(report))
                } else {
                    Ok(CheckoutOutcome::Failed(report))
                }
            }
            Err(Error::LocalChangesExist { count, collections }) => {
                self.audit(
                    Event::new(&self.repo_path, &from, EventType::CheckoutAborted)
                        .with_comment(&format!("{count} local change(s), target {branch}")),
                );
                Ok(CheckoutOutcome::Aborted {
                    branch: from,
                    target: branch.to_string(),
                    local_changes: count,
                    collections,
                })
            }
            Err(e) => {
                self.audit(
                    Event::new(&self.repo_path, &from, EventType::CheckoutFailed)
                        .with_comment(&format!("target {branch}: {e}")),
                );
                Err(e)
            }
        }
    }

    // ── Pull ──────────────────────────────────────────────────

    /// Rebuild `collection` in the document store from the current branch.
    ///
    /// # Errors
    ///
    /// Returns an error tagged with the full-sync step if either store fails.
    pub fn full_sync(&mut self, collection: &str) -> Result<FullSyncReport> {
        validate_collection_name(collection)?;
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        let report = FullSync::new(&self.versioned, &mut self.documents, &mut self.state, &self.repo_path)
            .with_embedding_model(self.options.embedding_model.as_deref())
            .with_batch_size(self.options.batch_size)
            .run(collection)
            .map_err(|e| e.at(Step::FullSync))?;
        self.audit(
            Event::new(&self.repo_path, &report.branch, EventType::FullSyncCompleted)
                .with_collection(collection)
                .with_commit(report.commit.as_deref())
                .with_comment(&format!("{} document(s)", report.added)),
        );
        Ok(report)
    }

    // ── Read-only views ───────────────────────────────────────

    /// Local changes of one collection, or of every collection.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub fn get_local_changes(&self, collection: Option<&str>) -> Result<LocalChangesReport> {
        let branch = self.current_branch()?;
        let names = match collection {
            Some(name) => vec![name.to_string()],
            None => self
                .documents
                .list_collections()?
                .into_iter()
                .map(|c| c.name)
                .collect(),
        };
        let detector = ChangeDetector::new(&self.versioned, &self.documents, &self.state, &self.repo_path, &branch);
        let mut collections = Vec::new();
        for name in &names {
            let summary = detector.detect_local_changes(name)?.summary();
            if summary.total > 0 {
                collections.push(summary);
            }
        }
        let collection_changes = if collection.is_none() {
            CollectionChangeDetector::new(&self.versioned, &self.documents, &self.state, &self.repo_path, &branch)
                .detect_collection_changes()?
        } else {
            CollectionChangeSet::default()
        };
        let total = collections.iter().map(|c| c.total).sum::<usize>() + collection_changes.total_changes();
        Ok(LocalChangesReport {
            branch,
            collections,
            collection_changes,
            total,
        })
    }

    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub fn get_status(&self) -> Result<StatusReport> {
        collect_status(&self.versioned, &self.documents, &self.state, &self.repo_path)
    }

    /// Sync state records of this repository, every branch.
    pub fn sync_states(&self) -> Vec<SyncStateRecord> {
        self.state.list_sync_states(&self.repo_path)
    }

    /// Most recent audit events, newest first.
    pub fn events(&self, limit: Option<u32>) -> Vec<Event> {
        self.state.events(&self.repo_path, limit)
    }

    // ── Merge ─────────────────────────────────────────────────

    /// Preview merging `source` into `target` (default: current branch).
    ///
    /// # Errors
    ///
    /// Returns an error if a ref cannot be read.
    pub fn preview_merge(&self, source: &str, target: Option<&str>) -> Result<MergePreview> {
        let target = match target {
            Some(t) => t.to_string(),
            None => self.current_branch()?,
        };
        ConflictAnalyzer::new(&self.versioned).preview(source, &target)
    }

    /// Merge `source` into `target` (default: current branch).
    ///
    /// Blocked merges change nothing. With `auto_resolve`, unresolved
    /// conflicts take the configured default resolution.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed resolutions and tagged
    /// versioned-store failures.
    pub fn execute_merge(
        &mut self,
        source: &str,
        target: Option<&str>,
        resolutions: &[ConflictResolution],
        auto_resolve: bool,
    ) -> Result<MergeResult> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        let current = self.current_branch()?;
        let target = target.map_or_else(|| current.clone(), String::from);

        let (count, collections) = CheckoutReconciler::new(
            &mut self.versioned,
            &mut self.documents,
            &mut self.state,
            &self.repo_path,
        )
        .local_changes(&current)?;
        if count > 0 {
            self.audit(
                Event::new(&self.repo_path, &current, EventType::MergeBlocked)
                    .with_comment(&format!("{count} local change(s) before merging {source}")),
            );
            return Ok(MergeResult::Blocked(MergeBlock::LocalChanges { count, collections }));
        }

        let result = MergeResolver::new(&mut self.versioned, &mut self.documents, &mut self.state, &self.repo_path)
            .with_embedding_model(self.options.embedding_model.as_deref())
            .with_batch_size(self.options.batch_size)
            .execute(
                source,
                &target,
                resolutions,
                auto_resolve,
                self.options.merge_default_resolution,
            );
        match result {
            Ok(report) => {
                self.audit(
                    Event::new(&self.repo_path, &target, EventType::MergeExecuted)
                        .with_commit(report.hash.as_deref())
                        .with_comment(&format!(
                            "merged {source}: {} auto-merged, {} resolved",
                            report.auto_merged,
                            report.resolved.len()
                        )),
                );
                Ok(MergeResult::Merged(report))
            }
            Err(Error::UnresolvedConflicts { count, conflict_ids }) => {
                self.audit(
                    Event::new(&self.repo_path, &target, EventType::MergeBlocked)
                        .with_comment(&format!("{count} unresolved conflict(s) merging {source}")),
                );
                Ok(MergeResult::Blocked(MergeBlock::UnresolvedConflicts { conflict_ids }))
            }
            Err(e) => Err(e),
        }
    }

    // ── Branches ──────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns an error if the versioned store cannot list branches.
    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.versioned.list_branches()
    }

    /// Create `name` at `start_point` without switching to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the versioned store rejects the branch.
    pub fn create_branch(&mut self, name: &str, start_point: Option<&str>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("branch name must not be empty".to_string()));
        }
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        self.versioned.create_branch(name, start_point)?;
        self.audit(
            Event::new(&self.repo_path, name, EventType::BranchCreated)
                .with_comment(&format!("from {}", start_point.unwrap_or("HEAD"))),
        );
        Ok(())
    }

    /// Delete a branch and every sync state record kept for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for the checked-out branch, or the
    /// versioned store's error.
    pub fn delete_branch(&mut self, name: &str, force: bool) -> Result<usize> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        if self.current_branch()? == name {
            return Err(Error::Validation(format!(
                "cannot delete the checked-out branch '{name}'"
            )));
        }
        self.versioned.delete_branch(name, force)?;
        let removed = self.state.delete_branch_sync_states(&self.repo_path, name)?;
        self.state.clear_pending(&self.repo_path, name)?;
        self.audit(
            Event::new(&self.repo_path, name, EventType::BranchDeleted)
                .with_comment(&format!("{removed} sync state record(s) removed")),
        );
        Ok(removed)
    }

    // ── Tracked document-store mutations ──────────────────────

    /// Create an empty collection. It reaches the versioned store on the
    /// next commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the collection exists.
    pub fn create_collection(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
        validate_collection_name(name)?;
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        self.documents.create_collection(name, metadata)
    }

    /// Add documents flagged as local changes, creating the collection if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid ids or a failing document store.
    pub fn add_documents(&mut self, collection: &str, docs: &[NewDocument]) -> Result<()> {
        validate_collection_name(collection)?;
        for doc in docs {
            validate_doc_id(&doc.id)?;
        }
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        if !self.documents.collection_exists(collection)? {
            self.documents.create_collection(collection, &Metadata::new())?;
        }
        let contents: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let metadatas: Vec<Metadata> = docs.iter().map(|d| dirty(d.metadata.clone())).collect();
        self.documents
            .add_documents(collection, &contents, &ids, Some(&metadatas))
    }

    /// Update documents and flag them as local changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectionNotFound`] for an unknown collection.
    pub fn update_documents(
        &mut self,
        collection: &str,
        ids: &[String],
        contents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        self.require_collection(collection)?;
        let flagged: Vec<Metadata> = match metadatas {
            Some(given) => given.iter().cloned().map(dirty).collect(),
            None => vec![dirty(Metadata::new()); ids.len()],
        };
        self.documents
            .update_documents(collection, ids, contents, Some(&flagged))
    }

    /// Delete documents and track the deletions with their metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectionNotFound`] for an unknown collection.
    pub fn delete_documents(&mut self, collection: &str, ids: &[String]) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        self.require_collection(collection)?;
        let branch = self.current_branch()?;
        let head = self.versioned.head_commit_hash().ok();
        let originals: BTreeMap<String, Metadata> = load_records(&self.documents, collection)?
            .into_iter()
            .filter(|r| ids.contains(&r.id))
            .map(|r| (r.id, r.metadata))
            .collect();
        let tracked: Vec<(String, Metadata)> = ids
            .iter()
            .map(|id| (id.clone(), originals.get(id).cloned().unwrap_or_default()))
            .collect();

        self.documents.delete_documents(collection, ids)?;
        self.state
            .track_document_deletions(&self.repo_path, collection, &branch, &tracked, head.as_deref())
    }

    /// Delete a collection and track the deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectionNotFound`] for an unknown collection.
    pub fn delete_collection(&mut self, name: &str) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        let metadata = self.require_collection(name)?;
        let branch = self.current_branch()?;
        let head = self.versioned.head_commit_hash().ok();
        self.documents.delete_collection(name)?;
        self.audit(
            Event::new(&self.repo_path, &branch, EventType::CollectionDeleted).with_collection(name),
        );
        self.state
            .track_collection_deletion(&self.repo_path, name, &branch, &metadata, head.as_deref())
    }

    /// Rename a collection and track the rename.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectionNotFound`] for an unknown collection and
    /// [`Error::Validation`] if the new name is invalid or taken.
    pub fn rename_collection(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        self.require_collection(old_name)?;
        validate_collection_name(new_name)?;
        if self.documents.collection_exists(new_name)? {
            return Err(Error::Validation(format!("collection '{new_name}' already exists")));
        }
        let branch = self.current_branch()?;
        let head = self.versioned.head_commit_hash().ok();
        self.documents.rename_collection(old_name, new_name)?;
        self.audit(
            Event::new(&self.repo_path, &branch, EventType::CollectionRenamed)
                .with_collection(new_name)
                .with_comment(&format!("from {old_name}")),
        );
        self.state
            .track_rename(&self.repo_path, old_name, new_name, &branch, head.as_deref())
    }

    /// Replace a collection's metadata and track the update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectionNotFound`] for an unknown collection.
    pub fn update_collection_metadata(&mut self, name: &str, metadata: &Metadata) -> Result<()> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);
        let old = self.require_collection(name)?;
        let branch = self.current_branch()?;
        let head = self.versioned.head_commit_hash().ok();
        self.documents.update_collection_metadata(name, metadata)?;
        self.state
            .track_update(&self.repo_path, name, &branch, &old, metadata, head.as_deref())
    }

    fn require_collection(&self, name: &str) -> Result<Metadata> {
        self.documents
            .list_collections()?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.metadata)
            .ok_or_else(|| Error::CollectionNotFound {
                name: name.to_string(),
            })
    }

    // ── Sync state ────────────────────────────────────────────

    /// Recompute sync state records for `branch` (default: current).
    ///
    /// Document counts come from the branch head; entry counts from the
    /// document store when the branch is checked out. Returns `false` when
    /// the branch holds no collections.
    ///
    /// # Errors
    ///
    /// Returns an error if the branch cannot be read or a record cannot be
    /// written.
    pub fn reconstruct_sync_state(&mut self, branch: Option<&str>) -> Result<bool> {
        let handle = self.lock_handle();
        let _guard = handle.as_deref().map(acquire);

        let current = self.current_branch()?;
        let branch = branch.map_or_else(|| current.clone(), String::from);
        let head = self.versioned.resolve_ref(&branch)?;

        let mut counts: BTreeMap<String, usize> = self
            .versioned
            .table_rows_at(COLLECTIONS_TABLE, &branch)?
            .iter()
            .filter_map(|row| row_string(row, "collection_name"))
            .map(|name| (name, 0))
            .collect();
        for row in self.versioned.table_rows_at(DOCUMENTS_TABLE, &branch)? {
            if let Some(name) = row_string(&row, "collection_name") {
                *counts.entry(name).or_default() += 1;
            }
        }
        if counts.is_empty() {
            return Ok(false);
        }

        for (collection, document_count) in &counts {
            let existing = self.state.get_sync_state(&self.repo_path, collection, &branch);
            let chunk_count = if branch == current && self.documents.collection_exists(collection)? {
                self.documents.get_document_count(collection)?
            } else {
                existing.as_ref().map_or(*document_count, |r| r.chunk_count)
            };
            let mut record = existing
                .unwrap_or_else(|| SyncStateRecord::new(&self.repo_path, collection, &branch))
                .synced(Some(head.clone()), *document_count, chunk_count);
            if self.options.embedding_model.is_some() {
                record.embedding_model.clone_from(&self.options.embedding_model);
            }
            self.state.upsert_sync_state(&record)?;
        }
        self.audit(
            Event::new(&self.repo_path, &branch, EventType::StateReconstructed)
                .with_commit(Some(&head))
                .with_comment(&format!("{} collection(s)", counts.len())),
        );
        Ok(true)
    }
}

fn dirty(mut metadata: Metadata) -> Metadata {
    metadata.insert(IS_LOCAL_CHANGE.to_string(), ChangeFlag::Dirty.as_value());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::SqliteDocumentStore;
    use crate::sync::content_hash;
    use crate::versioned::SnapshotStore;
    use serde_json::json;

    type Manager = SyncManager<SnapshotStore, SqliteDocumentStore>;

    fn manager() -> Manager {
        let mut m = SyncManager::new(
            "/repo",
            SnapshotStore::open_memory().unwrap(),
            SqliteDocumentStore::open_memory().unwrap(),
            StateStore::open_memory().unwrap(),
        );
        m.initialize().unwrap();
        m
    }

    fn doc(id: &str, content: &str) -> NewDocument {
        NewDocument {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    fn commit(m: &mut Manager, message: &str) -> CommitReport {
        match m.process_commit(message, true).unwrap() {
            CommitOutcome::Committed(report) => report,
            CommitOutcome::NoChanges { .. } => panic!("expected a commit"),
        }
    }

    fn checkout(m: &mut Manager, branch: &str, create_new: bool) -> CheckoutReport {
        match m.process_checkout(branch, create_new, None).unwrap() {
            CheckoutOutcome::Completed(report) => report,
            other => panic!("checkout did not complete: {other:?}"),
        }
    }

    fn contents(m: &Manager, collection: &str) -> Vec<(String, String)> {
        load_records(m.documents(), collection)
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.content))
            .collect()
    }

    #[test]
    fn test_restaging_without_edits_has_no_changes() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one"), doc("d2", "two")]).unwrap();
        commit(&mut m, "first");

        assert_eq!(m.get_local_changes(Some("notes")).unwrap().total, 0);
        assert!(matches!(
            m.process_commit("again", true).unwrap(),
            CommitOutcome::NoChanges { .. }
        ));
    }

    #[test]
    fn test_checkout_cycle_is_content_exact() {
        let mut m = manager();
        m.add_documents("notes", &[doc("doc1", "Original 1"), doc("doc2", "Original 2")])
            .unwrap();
        commit(&mut m, "main");

        checkout(&mut m, "feature", true);
        m.update_documents(
            "notes",
            &["doc1".into(), "doc2".into()],
            Some(&["Modified 1".into(), "Modified 2".into()]),
            None,
        )
        .unwrap();
        commit(&mut m, "feature");

        for _ in 0..2 {
            checkout(&mut m, "main", false);
            assert_eq!(
                contents(&m, "notes"),
                vec![("doc1".into(), "Original 1".into()), ("doc2".into(), "Original 2".into())]
            );
            let report = checkout(&mut m, "feature", false);
            assert_eq!(report.reconcile.collections[0].updated, 2);
            assert_eq!(
                contents(&m, "notes"),
                vec![("doc1".into(), "Modified 1".into()), ("doc2".into(), "Modified 2".into())]
            );
        }
        let records = load_records(m.documents(), "notes").unwrap();
        assert_eq!(records[0].content_hash, content_hash("Modified 1"));
    }

    #[test]
    fn test_branch_sync_states_are_isolated() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        let main_commit = commit(&mut m, "main").hash;

        checkout(&mut m, "feature", true);
        assert!(m.state().get_sync_state("/repo", "notes", "feature").is_none());

        m.add_documents("notes", &[doc("d2", "two")]).unwrap();
        commit(&mut m, "feature");

        let main = m.state().get_sync_state("/repo", "notes", "main").unwrap();
        assert_eq!(main.last_sync_commit.as_deref(), Some(main_commit.as_str()));
        assert_eq!(main.document_count, 1);
        let feature = m.state().get_sync_state("/repo", "notes", "feature").unwrap();
        assert_eq!(feature.document_count, 2);
    }

    #[test]
    fn test_collection_delete_reports_cascade_count() {
        let mut m = manager();
        let docs: Vec<NewDocument> = (0..4).map(|i| doc(&format!("d{i}"), "x")).collect();
        m.add_documents("doomed", &docs).unwrap();
        commit(&mut m, "seed");

        m.delete_collection("doomed").unwrap();
        let report = commit(&mut m, "drop");
        assert_eq!(report.collection_changes.deleted, vec![("doomed".to_string(), 4)]);
    }

    #[test]
    fn test_rename_then_delete_removes_both_names() {
        let mut m = manager();
        m.add_documents("first", &[doc("d1", "x")]).unwrap();
        commit(&mut m, "seed");

        m.rename_collection("first", "second").unwrap();
        m.delete_collection("second").unwrap();
        let report = commit(&mut m, "gone");

        let deleted: Vec<&str> = report
            .collection_changes
            .deleted
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert!(deleted.contains(&"first"));
        assert!(deleted.contains(&"second"));
        assert!(report.collection_changes.renamed.is_empty());
    }

    #[test]
    fn test_abort_keeps_branch_and_changes() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        m.create_branch("other", None).unwrap();
        m.update_documents("notes", &["d1".into()], Some(&["edited".into()]), None)
            .unwrap();

        let outcome = m.process_checkout("other", false, Some(CheckoutPolicy::Abort)).unwrap();
        assert!(matches!(outcome, CheckoutOutcome::Aborted { local_changes: 1, .. }));
        assert_eq!(m.versioned().current_branch().unwrap(), "main");
        assert_eq!(m.get_local_changes(None).unwrap().total, 1);

        let events = m.events(Some(1));
        assert_eq!(events[0].event_type, EventType::CheckoutAborted);
    }

    fn carry(m: &mut Manager, branch: &str) -> CheckoutReport {
        match m.process_checkout(branch, false, Some(CheckoutPolicy::Carry)).unwrap() {
            CheckoutOutcome::Completed(report) => report,
            other => panic!("carry did not complete: {other:?}"),
        }
    }

    fn collection_names(m: &Manager) -> Vec<String> {
        m.documents()
            .list_collections()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_carry_keeps_tracked_document_deletion() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one"), doc("d2", "two")]).unwrap();
        commit(&mut m, "seed");
        m.create_branch("other", None).unwrap();
        m.delete_documents("notes", &["d2".into()]).unwrap();
        assert_eq!(m.get_local_changes(None).unwrap().total, 1);

        let report = carry(&mut m, "other");
        assert_eq!(report.reconcile.collections[0].added, 0);
        assert_eq!(contents(&m, "notes"), vec![("d1".into(), "one".into())]);

        let changes = m.get_local_changes(None).unwrap();
        assert_eq!(changes.branch, "other");
        assert_eq!(changes.total, 1);
        assert_eq!(changes.collections[0].deleted, vec!["d2".to_string()]);
    }

    #[test]
    fn test_carry_keeps_tracked_rename() {
        let mut m = manager();
        m.add_documents("old", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        m.create_branch("other", None).unwrap();
        m.rename_collection("old", "new").unwrap();
        let before = m.get_local_changes(None).unwrap().total;

        carry(&mut m, "other");
        assert_eq!(collection_names(&m), vec!["new".to_string()]);
        assert_eq!(contents(&m, "new"), vec![("d1".into(), "one".into())]);

        let changes = m.get_local_changes(None).unwrap();
        assert_eq!(changes.total, before);
        let renamed = &changes.collection_changes.renamed;
        assert_eq!(renamed.len(), 1);
        assert_eq!((renamed[0].old_name.as_str(), renamed[0].new_name.as_str()), ("old", "new"));
    }

    #[test]
    fn test_carry_does_not_recreate_deleted_collection() {
        let mut m = manager();
        m.add_documents("keep", &[doc("k1", "stay")]).unwrap();
        m.add_documents("gone", &[doc("g1", "bye")]).unwrap();
        commit(&mut m, "seed");
        m.create_branch("other", None).unwrap();
        m.delete_collection("gone").unwrap();

        carry(&mut m, "other");
        assert_eq!(collection_names(&m), vec!["keep".to_string()]);
        let deleted = m.get_local_changes(None).unwrap().collection_changes.deleted;
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "gone");
        assert!(deleted[0].tracked);
    }

    #[test]
    fn test_reset_first_clears_flag_on_unchanged_document() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        m.create_branch("other", None).unwrap();
        m.update_documents("notes", &["d1".into()], Some(&["one".into()]), None)
            .unwrap();
        assert_eq!(m.get_local_changes(None).unwrap().total, 1);

        let outcome = m
            .process_checkout("other", false, Some(CheckoutPolicy::ResetFirst))
            .unwrap();
        assert!(matches!(outcome, CheckoutOutcome::Completed(_)));
        let records = load_records(m.documents(), "notes").unwrap();
        assert!(!records[0].change_flag.is_dirty());
        assert_eq!(m.get_local_changes(None).unwrap().total, 0);
    }

    #[test]
    fn test_full_sync_on_empty_branch() {
        let mut m = manager();
        let report = m.full_sync("fresh").unwrap();
        assert_eq!(report.added, 0);
        assert!(m.documents().collection_exists("fresh").unwrap());
    }

    #[test]
    fn test_full_sync_recreates_deleted_collection() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        m.documents.delete_collection("notes").unwrap();

        let report = m.full_sync("notes").unwrap();
        assert!(report.created_collection);
        assert_eq!(contents(&m, "notes"), vec![("d1".into(), "one".into())]);
    }

    #[test]
    fn test_merge_blocked_then_resolved() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "base")]).unwrap();
        commit(&mut m, "base");
        m.create_branch("feature", None).unwrap();
        m.update_documents("notes", &["d1".into()], Some(&["main".into()]), None)
            .unwrap();
        commit(&mut m, "main edit");
        checkout(&mut m, "feature", false);
        m.update_documents("notes", &["d1".into()], Some(&["feature".into()]), None)
            .unwrap();
        commit(&mut m, "feature edit");
        checkout(&mut m, "main", false);

        let preview = m.preview_merge("feature", None).unwrap();
        assert_eq!(preview.conflicts.len(), 1);

        let blocked = m.execute_merge("feature", None, &[], false).unwrap();
        assert!(matches!(blocked, MergeResult::Blocked(MergeBlock::UnresolvedConflicts { .. })));

        let resolution = ConflictResolution {
            conflict_id: preview.conflicts[0].conflict_id.clone(),
            resolution: ResolutionType::KeepTheirs,
            custom_values: None,
        };
        let merged = m.execute_merge("feature", None, &[resolution], false).unwrap();
        assert!(matches!(merged, MergeResult::Merged(_)));
        assert_eq!(contents(&m, "notes"), vec![("d1".into(), "feature".into())]);
    }

    #[test]
    fn test_merge_blocked_by_local_changes() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "base")]).unwrap();
        commit(&mut m, "base");
        m.create_branch("feature", None).unwrap();
        m.add_documents("notes", &[doc("d2", "draft")]).unwrap();

        let outcome = m.execute_merge("feature", None, &[], true).unwrap();
        assert!(matches!(outcome, MergeResult::Blocked(MergeBlock::LocalChanges { count: 1, .. })));
    }

    #[test]
    fn test_delete_branch_drops_its_states() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        checkout(&mut m, "feature", true);
        m.add_documents("notes", &[doc("d2", "two")]).unwrap();
        commit(&mut m, "feature");
        checkout(&mut m, "main", false);

        assert!(m.delete_branch("main", true).is_err());
        let removed = m.delete_branch("feature", true).unwrap();
        assert_eq!(removed, 1);
        assert!(m.state().get_sync_state("/repo", "notes", "feature").is_none());
        assert!(!m.list_branches().unwrap().contains(&"feature".to_string()));
    }

    #[test]
    fn test_reconstruct_rebuilds_missing_record() {
        let mut m = manager();
        m.add_documents("notes", &[doc("d1", "one"), doc("d2", "two")]).unwrap();
        let hash = commit(&mut m, "seed").hash;
        checkout(&mut m, "feature", true);
        assert!(m.state().get_sync_state("/repo", "notes", "feature").is_none());

        assert!(m.reconstruct_sync_state(None).unwrap());
        let record = m.state().get_sync_state("/repo", "notes", "feature").unwrap();
        assert_eq!(record.document_count, 2);
        assert_eq!(record.last_sync_commit.as_deref(), Some(hash.as_str()));
    }

    #[test]
    fn test_tracked_deletion_keeps_original_metadata() {
        let mut m = manager();
        let mut d = doc("d1", "one");
        d.metadata.insert("tag".into(), json!("keep"));
        m.add_documents("notes", &[d]).unwrap();
        commit(&mut m, "seed");

        m.delete_documents("notes", &["d1".into()]).unwrap();
        let pending = m.state().pending_deletions("/repo", "main");
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].original_metadata.as_ref().and_then(|md| md.get("tag")),
            Some(&json!("keep"))
        );

        commit(&mut m, "delete");
        assert!(m.state().pending_deletions("/repo", "main").is_empty());
    }

    #[test]
    fn test_shared_locks_registry() {
        let locks = Arc::new(RepoLocks::new());
        let mut m = manager().with_locks(Arc::clone(&locks));
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_tracked_mutation_waits_for_repo_lock() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let locks = Arc::new(RepoLocks::new());
        let mut m = manager().with_locks(Arc::clone(&locks));
        m.add_documents("notes", &[doc("d1", "one")]).unwrap();
        commit(&mut m, "seed");

        let handle = locks.handle("/repo");
        let guard = acquire(&handle);
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                m.delete_collection("notes").unwrap();
                done.store(true, Ordering::SeqCst);
                m
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));
        drop(guard);

        let m = worker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(!m.documents().collection_exists("notes").unwrap());
    }
}
