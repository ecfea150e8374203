//! Error types for branchsync.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=state, 3=not_found, 4=validation, etc.)
//! - Retryability flags for callers that re-run failed steps
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::fmt;
use thiserror::Error;

/// Result type alias for branchsync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Step ──────────────────────────────────────────────────────

/// The orchestration step an I/O failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Check,
    Stage,
    Commit,
    Switch,
    Reconcile,
    FullSync,
    Merge,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Check => "check",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Switch => "switch",
            Self::Reconcile => "reconcile",
            Self::FullSync => "full_sync",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Sync state (exit 2)
    SyncStateError,
    DatabaseError,

    // Not found (exit 3)
    CollectionNotFound,
    ExecutableNotFound,

    // Validation (exit 4)
    ValidationError,

    // Expected sync conditions (exit 5)
    NoChanges,
    LocalChangesExist,
    UnresolvedConflicts,

    // Versioned store (exit 6)
    VersionedStoreError,
    VersionedStoreTimeout,

    // Document store (exit 7)
    DocumentStoreError,

    // Reconciliation (exit 8)
    ReconciliationPartialFailure,

    // Config / I/O (exit 9)
    ConfigError,
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::SyncStateError => "SYNC_STATE_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::CollectionNotFound => "COLLECTION_NOT_FOUND",
            Self::ExecutableNotFound => "EXECUTABLE_NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NoChanges => "NO_CHANGES",
            Self::LocalChangesExist => "LOCAL_CHANGES_EXIST",
            Self::UnresolvedConflicts => "UNRESOLVED_CONFLICTS",
            Self::VersionedStoreError => "VERSIONED_STORE_ERROR",
            Self::VersionedStoreTimeout => "VERSIONED_STORE_TIMEOUT",
            Self::DocumentStoreError => "DOCUMENT_STORE_ERROR",
            Self::ReconciliationPartialFailure => "RECONCILIATION_PARTIAL_FAILURE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-9).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::SyncStateError | Self::DatabaseError => 2,
            Self::CollectionNotFound | Self::ExecutableNotFound => 3,
            Self::ValidationError => 4,
            Self::NoChanges | Self::LocalChangesExist | Self::UnresolvedConflicts => 5,
            Self::VersionedStoreError | Self::VersionedStoreTimeout => 6,
            Self::DocumentStoreError => 7,
            Self::ReconciliationPartialFailure => 8,
            Self::ConfigError | Self::IoError | Self::JsonError => 9,
        }
    }

    /// Whether re-running the same call can succeed without other changes.
    ///
    /// Timeouts are retryable by the caller but are never retried internally.
    /// Partial reconciliation is retryable per failed collection.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionedStoreTimeout
                | Self::ReconciliationPartialFailure
                | Self::DatabaseError
                | Self::ValidationError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in branchsync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No changes to commit")]
    NoChanges,

    #[error("{count} uncommitted local change(s) in: {}", collections.join(", "))]
    LocalChangesExist {
        count: usize,
        collections: Vec<String>,
    },

    #[error("Sync state store error: {0}")]
    SyncState(String),

    #[error("Versioned store `{op}` failed: {message}")]
    VersionedStore { op: String, message: String },

    #[error("Versioned store `{op}` timed out after {seconds}s")]
    VersionedStoreTimeout { op: String, seconds: u64 },

    #[error("Versioned store executable not found: {executable}")]
    ExecutableNotFound { executable: String },

    #[error("Document store error: {0}")]
    DocumentStore(String),

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Reconciliation failed for {} collection(s): {}", failed.len(), failed.join(", "))]
    ReconciliationPartialFailure {
        failed: Vec<String>,
        succeeded: Vec<String>,
    },

    #[error("{count} merge conflict(s) have no resolution")]
    UnresolvedConflicts {
        count: usize,
        conflict_ids: Vec<String>,
    },

    #[error("{step} step failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<Error>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a versioned-store failure for the named operation.
    pub fn versioned(op: &str, message: impl Into<String>) -> Self {
        Self::VersionedStore {
            op: op.to_string(),
            message: message.into(),
        }
    }

    /// Tag this error with the step it happened in.
    ///
    /// Already-tagged errors and expected outcomes keep their original shape.
    #[must_use]
    pub fn at(self, step: Step) -> Self {
        match self {
            Self::Step { .. }
            | Self::NoChanges
            | Self::LocalChangesExist { .. }
            | Self::UnresolvedConflicts { .. }
            | Self::Validation(_) => self,
            other => Self::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The step this error was tagged with, if any.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The untagged error underneath any step tags.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NoChanges => ErrorCode::NoChanges,
            Self::LocalChangesExist { .. } => ErrorCode::LocalChangesExist,
            Self::SyncState(_) => ErrorCode::SyncStateError,
            Self::VersionedStore { .. } => ErrorCode::VersionedStoreError,
            Self::VersionedStoreTimeout { .. } => ErrorCode::VersionedStoreTimeout,
            Self::ExecutableNotFound { .. } => ErrorCode::ExecutableNotFound,
            Self::DocumentStore(_) => ErrorCode::DocumentStoreError,
            Self::CollectionNotFound { .. } => ErrorCode::CollectionNotFound,
            Self::ReconciliationPartialFailure { .. } => ErrorCode::ReconciliationPartialFailure,
            Self::UnresolvedConflicts { .. } => ErrorCode::UnresolvedConflicts,
            Self::Step { source, .. } => source.error_code(),
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NoChanges => Some(
                "Nothing was staged. Edit documents or collections first, or check `bsync changes`."
                    .to_string(),
            ),
            Self::LocalChangesExist { .. } => Some(
                "Commit first (`bsync commit -m ...`) or choose a policy: \
                 --policy commit_first | carry | reset_first"
                    .to_string(),
            ),
            Self::ExecutableNotFound { executable } => Some(format!(
                "Install dolt or point BSYNC_DOLT at the binary (looked for '{executable}')."
            )),
            Self::VersionedStoreTimeout { .. } => Some(
                "Increase BSYNC_TIMEOUT_SECS or re-run the command; nothing was retried."
                    .to_string(),
            ),
            Self::ReconciliationPartialFailure { failed, .. } => Some(format!(
                "Re-run `bsync full-sync <collection>` for: {}",
                failed.join(", ")
            )),
            Self::UnresolvedConflicts { .. } => Some(
                "Preview with `bsync merge preview`, then pass --resolve <id>=ours|theirs or --auto."
                    .to_string(),
            ),
            Self::CollectionNotFound { name } => Some(format!(
                "No collection named '{name}'. Use `bsync status` to list collections."
            )),
            Self::Validation(msg) => {
                if msg.contains("policy") {
                    Some("Valid policies: abort, commit_first, carry, reset_first".to_string())
                } else if msg.contains("resolution") {
                    Some("Valid resolutions: keep_ours, keep_theirs (synonyms: ours, theirs)".to_string())
                } else {
                    None
                }
            }
            Self::Step { source, .. } => source.hint(),
            Self::SyncState(_)
            | Self::VersionedStore { .. }
            | Self::DocumentStore(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(step) = self.step() {
            obj["error"]["step"] = serde_json::Value::String(step.to_string());
        }
        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
