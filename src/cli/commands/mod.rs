//! Command implementations.

pub mod branch;
pub mod changes;
pub mod checkout;
pub mod collection;
pub mod commit;
pub mod completions;
pub mod doc;
pub mod full_sync;
pub mod init;
pub mod merge;
pub mod state;
pub mod status;
pub mod version;

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::cli::{Backend, Cli};
use crate::config::{resolve_repo_path, SyncConfig};
use crate::docstore::chunking::ChunkConfig;
use crate::docstore::SqliteDocumentStore;
use crate::error::{Error, Result};
use crate::model::Metadata;
use crate::storage::StateStore;
use crate::sync::SyncManager;
use crate::versioned::{DoltCli, SnapshotStore, VersionedStore};

/// Manager over whichever versioned backend the CLI selected.
pub type Manager = SyncManager<Box<dyn VersionedStore>, SqliteDocumentStore>;

/// Resolve configuration and open every store for the selected repository.
///
/// # Errors
///
/// Returns an error if configuration is invalid or a store cannot be opened.
pub fn open_manager(cli: &Cli) -> Result<(Manager, SyncConfig)> {
    let repo_path = resolve_repo_path(cli.repo.as_deref())?;
    let config = SyncConfig::load(&repo_path)?;

    let versioned: Box<dyn VersionedStore> = match cli.backend {
        Backend::Dolt => Box::new(DoltCli::new(
            config.dolt_executable.clone(),
            config.repo_path.clone(),
            config.command_timeout(),
        )),
        Backend::Snapshot => Box::new(SnapshotStore::open(&config.snapshot_dir())?),
    };

    ensure_parent(&config.document_store_path)?;
    let chunking = ChunkConfig {
        max_chars: config.chunk_max_chars,
        ..ChunkConfig::default()
    };
    let documents = SqliteDocumentStore::open(&config.document_store_path, chunking)?;

    ensure_parent(&config.state_db_path)?;
    let state = StateStore::open(&config.state_db_path);

    debug!(
        repo = %config.repo_path.display(),
        backend = ?cli.backend,
        state_db = %config.state_db_path.display(),
        "Opened stores"
    );
    let manager = SyncManager::new(config.repo_path.to_string_lossy(), versioned, documents, state)
        .with_options(config.sync_options());
    Ok((manager, config))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Print `value` as one line of JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Parse a `--metadata` argument.
///
/// # Errors
///
/// Returns [`Error::Validation`] unless the text is a JSON object.
pub fn parse_metadata(raw: Option<&str>) -> Result<Metadata> {
    let Some(raw) = raw else {
        return Ok(Metadata::new());
    };
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        _ => Err(Error::Validation(format!(
            "metadata must be a JSON object, got '{raw}'"
        ))),
    }
}

/// First twelve characters of a commit hash.
#[must_use]
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
