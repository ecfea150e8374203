//! Per-repository mutual exclusion.
//!
//! Managers that share a [`RepoLocks`] registry serialize their mutating
//! calls per repository path. Different paths never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of one mutex per repository path.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding `repo_path`, created on first use.
    #[must_use]
    pub fn handle(&self, repo_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(repo_path.to_string()).or_default())
    }

    /// Number of repositories seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock `handle`, recovering from a poisoned mutex.
///
/// A panic in another holder leaves no partially applied in-memory state
/// behind; both stores are the source of truth.
pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
