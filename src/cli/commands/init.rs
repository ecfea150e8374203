//! Initialize a branchsync repository.
//!
//! Creates the versioned repository (if missing), the sync tables inside it
//! and the per-repository `.branchsync/` directory. The state database is
//! created lazily on the first write.

use serde::Serialize;
use std::path::PathBuf;

use super::{print_json, Manager};
use crate::config::{repo_config_dir, SyncConfig};
use crate::error::Result;

#[derive(Serialize)]
struct InitOutput {
    repo_path: PathBuf,
    branch: String,
    head: String,
    document_store: PathBuf,
    state_db: PathBuf,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns an error if the repository or schema cannot be created.
pub fn execute(manager: &mut Manager, config: &SyncConfig, json: bool) -> Result<()> {
    std::fs::create_dir_all(repo_config_dir(&config.repo_path))?;
    manager.initialize()?;

    let output = InitOutput {
        repo_path: config.repo_path.clone(),
        branch: manager.versioned().current_branch()?,
        head: manager.versioned().head_commit_hash()?,
        document_store: config.document_store_path.clone(),
        state_db: config.state_db_path.clone(),
    };

    if json {
        return print_json(&output);
    }
    println!("Initialized branchsync repository at {}", output.repo_path.display());
    println!("  Branch:         {}", output.branch);
    println!("  Document store: {}", output.document_store.display());
    println!("  State DB:       {}", output.state_db.display());
    Ok(())
}
