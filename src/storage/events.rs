//! Audit trail of orchestrated sync operations.

use rusqlite::{Connection, Result};
use serde::Serialize;

/// Event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Push path
    CommitProcessed,
    CollectionDeleted,
    CollectionRenamed,

    // Pull path
    CheckoutCompleted,
    CheckoutAborted,
    CheckoutFailed,
    FullSyncCompleted,

    // Merge
    MergeExecuted,
    MergeBlocked,

    // Branches and state
    BranchCreated,
    BranchDeleted,
    StateReconstructed,
}

impl EventType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CommitProcessed => "commit_processed",
            Self::CollectionDeleted => "collection_deleted",
            Self::CollectionRenamed => "collection_renamed",
            Self::CheckoutCompleted => "checkout_completed",
            Self::CheckoutAborted => "checkout_aborted",
            Self::CheckoutFailed => "checkout_failed",
            Self::FullSyncCompleted => "full_sync_completed",
            Self::MergeExecuted => "merge_executed",
            Self::MergeBlocked => "merge_blocked",
            Self::BranchCreated => "branch_created",
            Self::BranchDeleted => "branch_deleted",
            Self::StateReconstructed => "state_reconstructed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "commit_processed" => Self::CommitProcessed,
            "collection_deleted" => Self::CollectionDeleted,
            "collection_renamed" => Self::CollectionRenamed,
            "checkout_completed" => Self::CheckoutCompleted,
            "checkout_aborted" => Self::CheckoutAborted,
            "checkout_failed" => Self::CheckoutFailed,
            "full_sync_completed" => Self::FullSyncCompleted,
            "merge_executed" => Self::MergeExecuted,
            "merge_blocked" => Self::MergeBlocked,
            "branch_created" => Self::BranchCreated,
            "branch_deleted" => Self::BranchDeleted,
            "state_reconstructed" => Self::StateReconstructed,
            _ => return None,
        })
    }
}

/// An audit event record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub repo_path: String,
    pub branch: String,
    pub collection_name: Option<String>,
    pub event_type: EventType,
    pub commit_hash: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
}

impl Event {
    /// Create a new event (id will be assigned by database).
    #[must_use]
    pub fn new(repo_path: &str, branch: &str, event_type: EventType) -> Self {
        Self {
            id: 0,
            repo_path: repo_path.to_string(),
            branch: branch.to_string(),
            collection_name: None,
            event_type,
            commit_hash: None,
            comment: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection_name = Some(collection.to_string());
        self
    }

    #[must_use]
    pub fn with_commit(mut self, hash: Option<&str>) -> Self {
        self.commit_hash = hash.map(String::from);
        self
    }

    /// Add a comment to the event.
    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

/// Insert an event into the database.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_events (repo_path, branch, collection_name, event_type, commit_hash, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            event.repo_path,
            event.branch,
            event.collection_name,
            event.event_type.as_str(),
            event.commit_hash,
            event.comment,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent events for a repository, newest first.
///
/// Rows with an unknown event type are skipped.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_events(conn: &Connection, repo_path: &str, limit: Option<u32>) -> Result<Vec<Event>> {
    let limit = limit.unwrap_or(100);
    let mut stmt = conn.prepare(
        "SELECT id, repo_path, branch, collection_name, event_type, commit_hash, comment, created_at
         FROM sync_events
         WHERE repo_path = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(rusqlite::params![repo_path, limit], |row| {
        let event_type: String = row.get(4)?;
        let Some(event_type) = EventType::parse(&event_type) else {
            return Ok(None);
        };
        Ok(Some(Event {
            id: row.get(0)?,
            repo_path: row.get(1)?,
            branch: row.get(2)?,
            collection_name: row.get(3)?,
            event_type,
            commit_hash: row.get(5)?,
            comment: row.get(6)?,
            created_at: row.get(7)?,
        }))
    })?;

    let mut events = Vec::new();
    for row in rows {
        if let Some(event) = row? {
            events.push(event);
        }
    }
    Ok(events)
}
