//! Branch-aware synchronization between the document store and the
//! versioned store.
//!
//! - **Push**: dirty documents and tracked collection changes → versioned
//!   rows → commit
//! - **Checkout**: branch switch under a local-change policy, then
//!   reconciliation of the document store to the new branch
//! - **Pull**: full rebuild of one collection from the current branch
//! - **Merge**: three-way conflict analysis, resolution and execution
//!
//! # Architecture
//!
//! Each document carries an `is_local_change` flag in the document store.
//! Writes through [`SyncManager`] set it; a commit stages flagged documents
//! and clears the flag. Deletions leave nothing behind in the document
//! store, so they are tracked in the local state store until the next
//! commit. Content hashes (SHA-256 of normalized content) decide whether a
//! document actually differs between the two stores.
//!
//! # Example
//!
//! ```ignore
//! use bsync::sync::{SyncManager, CheckoutOutcome};
//!
//! let mut manager = SyncManager::new(repo, versioned, documents, state);
//! manager.initialize()?;
//! manager.process_commit("Add notes", true)?;
//! match manager.process_checkout("feature", true, None)? {
//!     CheckoutOutcome::Completed(report) => println!("{}", report.to_branch),
//!     other => eprintln!("{other:?}"),
//! }
//! ```

mod changes;
mod checkout;
mod collections;
mod full_sync;
mod hash;
mod lock;
mod manager;
mod merge;
mod status;
mod syncer;
mod types;

pub use changes::{update_sync_state, Baseline, ChangeDetector};
pub use checkout::{
    CheckoutPolicy, CheckoutReconciler, CheckoutReport, CheckoutRequest, CheckoutState,
    ReconcilePass,
};
pub use collections::CollectionChangeDetector;
pub use full_sync::{FullSync, DEFAULT_BATCH_SIZE};
pub use hash::{content_hash, has_changed, normalize_content};
pub use lock::{acquire, RepoLocks};
pub use manager::{
    CheckoutOutcome, CommitOutcome, LocalChangesReport, MergeBlock, MergeResult, NewDocument,
    SyncManager, SyncOptions,
};
pub use merge::{
    apply_resolutions, conflict_id, ConflictAnalyzer, ConflictKind, ConflictResolution,
    MergeConflict, MergePreview, MergeReport, MergeResolver, ResolutionType,
};
pub use status::{collect_status, print_status, CollectionStatus, StatusReport};
pub use syncer::Syncer;
pub use types::{
    ChangeSummary, CollectionChangeSet, CollectionFailure, CollectionStageReport, CommitReport,
    DeletedCollection, FullSyncReport, LocalChangeSet, ReconcileReport, RenamedCollection,
    StageReport, UpdatedCollection,
};
