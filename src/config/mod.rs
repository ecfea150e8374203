//! Configuration management.
//!
//! This module resolves where each store lives and the sync defaults.
//!
//! # Architecture
//!
//! branchsync keeps its local sync state **outside** the versioned repository:
//! - **State DB**: single global database at `~/.branchsync/data/sync_state.db`
//! - **Document store**: per-repository `<repo>/.branchsync/documents.db`
//! - **Config files**: `<repo>/.branchsync/config.json` over the global
//!   `~/.branchsync/config.json`
//!
//! Priority for every setting: explicit CLI flag > environment variable >
//! repository config file > global config file > built-in default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sync::{CheckoutPolicy, ResolutionType, SyncOptions, DEFAULT_BATCH_SIZE};
use crate::validate::{parse_checkout_policy, parse_resolution};

/// Name of the per-repository and global configuration directory.
pub const CONFIG_DIR_NAME: &str = ".branchsync";
const CONFIG_FILE_NAME: &str = "config.json";

pub const ENV_REPO: &str = "BSYNC_REPO";
pub const ENV_STATE_DB: &str = "BSYNC_STATE_DB";
pub const ENV_DOCSTORE: &str = "BSYNC_DOCSTORE";
pub const ENV_DOLT: &str = "BSYNC_DOLT";
pub const ENV_TIMEOUT_SECS: &str = "BSYNC_TIMEOUT_SECS";
pub const ENV_CHECKOUT_POLICY: &str = "BSYNC_CHECKOUT_POLICY";
pub const ENV_MERGE_RESOLUTION: &str = "BSYNC_MERGE_RESOLUTION";

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncConfig {
    pub repo_path: PathBuf,
    pub dolt_executable: String,
    pub command_timeout_secs: u64,
    pub state_db_path: PathBuf,
    pub document_store_path: PathBuf,
    pub checkout_policy: CheckoutPolicy,
    pub merge_default_resolution: ResolutionType,
    pub batch_size: usize,
    pub chunk_max_chars: usize,
    pub embedding_model: Option<String>,
}

/// On-disk configuration. Every field is optional; missing fields fall
/// through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub dolt_executable: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub state_db_path: Option<PathBuf>,
    pub document_store_path: Option<PathBuf>,
    pub checkout_policy: Option<String>,
    pub merge_default_resolution: Option<String>,
    pub batch_size: Option<usize>,
    pub chunk_max_chars: Option<usize>,
    pub embedding_model: Option<String>,
}

impl ConfigFile {
    /// Read a config file. A missing file is an empty layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Fill unset fields from `lower`.
    #[must_use]
    pub fn over(self, lower: Self) -> Self {
        Self {
            dolt_executable: self.dolt_executable.or(lower.dolt_executable),
            command_timeout_secs: self.command_timeout_secs.or(lower.command_timeout_secs),
            state_db_path: self.state_db_path.or(lower.state_db_path),
            document_store_path: self.document_store_path.or(lower.document_store_path),
            checkout_policy: self.checkout_policy.or(lower.checkout_policy),
            merge_default_resolution: self
                .merge_default_resolution
                .or(lower.merge_default_resolution),
            batch_size: self.batch_size.or(lower.batch_size),
            chunk_max_chars: self.chunk_max_chars.or(lower.chunk_max_chars),
            embedding_model: self.embedding_model.or(lower.embedding_model),
        }
    }

    /// Layer built from environment variables.
    fn from_env(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            dolt_executable: lookup(ENV_DOLT),
            command_timeout_secs: lookup(ENV_TIMEOUT_SECS)
                .map(|v| parse_number(ENV_TIMEOUT_SECS, &v))
                .transpose()?,
            state_db_path: lookup(ENV_STATE_DB).map(PathBuf::from),
            document_store_path: lookup(ENV_DOCSTORE).map(PathBuf::from),
            checkout_policy: lookup(ENV_CHECKOUT_POLICY),
            merge_default_resolution: lookup(ENV_MERGE_RESOLUTION),
            ..Self::default()
        })
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{value}'")))
}

/// Get the global branchsync directory (`~/.branchsync/`).
#[must_use]
pub fn global_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(CONFIG_DIR_NAME))
}

/// Per-repository branchsync directory.
#[must_use]
pub fn repo_config_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(CONFIG_DIR_NAME)
}

/// Default location of the sync state database.
#[must_use]
pub fn default_state_db_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("data").join("sync_state.db"))
}

/// Resolve the repository path.
///
/// Priority:
/// 1. `explicit_path` from the CLI flag
/// 2. `BSYNC_REPO` environment variable
/// 3. Current directory
///
/// # Errors
///
/// Returns an error if the current directory cannot be read.
pub fn resolve_repo_path(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(ENV_REPO) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(std::env::current_dir()?)
}

impl SyncConfig {
    /// Resolve configuration for `repo_path` from the process environment
    /// and config files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unreadable config files or malformed
    /// values.
    pub fn load(repo_path: &Path) -> Result<Self> {
        Self::load_with(
            repo_path,
            global_config_dir().as_deref(),
            |name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()),
        )
    }

    /// Resolve configuration with an explicit global directory and
    /// environment lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unreadable config files or malformed
    /// values.
    pub fn load_with(
        repo_path: &Path,
        global_dir: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let repo_file = repo_config_dir(repo_path).join(CONFIG_FILE_NAME);
        let mut layers = ConfigFile::from_env(&env)?.over(ConfigFile::load(&repo_file)?);
        if let Some(dir) = global_dir {
            layers = layers.over(ConfigFile::load(&dir.join(CONFIG_FILE_NAME))?);
        }
        debug!(repo = %repo_path.display(), "Resolved configuration layers");

        let state_db_path = layers
            .state_db_path
            .or_else(|| global_dir.map(|dir| dir.join("data").join("sync_state.db")))
            .unwrap_or_else(|| repo_config_dir(repo_path).join("sync_state.db"));
        let checkout_policy = layers
            .checkout_policy
            .as_deref()
            .map(parse_checkout_policy)
            .transpose()?
            .unwrap_or_default();
        let merge_default_resolution = layers
            .merge_default_resolution
            .as_deref()
            .map(parse_resolution)
            .transpose()?
            .unwrap_or(ResolutionType::KeepOurs);
        let batch_size = layers.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }

        Ok(Self {
            document_store_path: layers
                .document_store_path
                .unwrap_or_else(|| repo_config_dir(repo_path).join("documents.db")),
            repo_path: repo_path.to_path_buf(),
            dolt_executable: layers.dolt_executable.unwrap_or_else(|| "dolt".to_string()),
            command_timeout_secs: layers.command_timeout_secs.unwrap_or(120),
            state_db_path,
            checkout_policy,
            merge_default_resolution,
            batch_size,
            chunk_max_chars: layers.chunk_max_chars.unwrap_or(2000),
            embedding_model: layers.embedding_model,
        })
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Directory holding the embedded snapshot store for offline use.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        repo_config_dir(&self.repo_path).join("versioned")
    }

    /// Manager options derived from this configuration.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            checkout_policy: self.checkout_policy,
            merge_default_resolution: self.merge_default_resolution,
            batch_size: self.batch_size,
            embedding_model: self.embedding_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE_NAME), body).unwrap();
    }

    #[test]
    fn test_defaults() {
        let repo = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let config = SyncConfig::load_with(repo.path(), Some(global.path()), no_env).unwrap();

        assert_eq!(config.dolt_executable, "dolt");
        assert_eq!(config.command_timeout_secs, 120);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.chunk_max_chars, 2000);
        assert_eq!(config.checkout_policy, CheckoutPolicy::Abort);
        assert_eq!(config.merge_default_resolution, ResolutionType::KeepOurs);
        assert_eq!(config.state_db_path, global.path().join("data").join("sync_state.db"));
        assert_eq!(
            config.document_store_path,
            repo.path().join(".branchsync").join("documents.db")
        );
    }

    #[test]
    fn test_repo_file_overrides_global_file() {
        let repo = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        write_config(global.path(), r#"{"batch_size": 10, "dolt_executable": "/opt/dolt"}"#);
        write_config(&repo_config_dir(repo.path()), r#"{"batch_size": 25, "checkout_policy": "stash"}"#);

        let config = SyncConfig::load_with(repo.path(), Some(global.path()), no_env).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.dolt_executable, "/opt/dolt");
        assert_eq!(config.checkout_policy, CheckoutPolicy::Carry);
    }

    #[test]
    fn test_env_overrides_files() {
        let repo = TempDir::new().unwrap();
        write_config(&repo_config_dir(repo.path()), r#"{"command_timeout_secs": 5}"#);
        let env: HashMap<&str, &str> = [
            (ENV_TIMEOUT_SECS, "30"),
            (ENV_MERGE_RESOLUTION, "theirs"),
            (ENV_STATE_DB, "/tmp/state.db"),
        ]
        .into_iter()
        .collect();

        let config =
            SyncConfig::load_with(repo.path(), None, |k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.merge_default_resolution, ResolutionType::KeepTheirs);
        assert_eq!(config.state_db_path, PathBuf::from("/tmp/state.db"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let repo = TempDir::new().unwrap();
        write_config(&repo_config_dir(repo.path()), r#"{"checkout_policy": "yolo"}"#);
        assert!(SyncConfig::load_with(repo.path(), None, no_env).is_err());

        let repo = TempDir::new().unwrap();
        write_config(&repo_config_dir(repo.path()), "not json");
        assert!(matches!(
            SyncConfig::load_with(repo.path(), None, no_env),
            Err(Error::Config(_))
        ));

        let repo = TempDir::new().unwrap();
        assert!(SyncConfig::load_with(repo.path(), None, |k| {
            (k == ENV_TIMEOUT_SECS).then(|| "soon".to_string())
        })
        .is_err());
    }

    #[test]
    fn test_sync_options_follow_config() {
        let repo = TempDir::new().unwrap();
        write_config(
            &repo_config_dir(repo.path()),
            r#"{"checkout_policy": "commit", "embedding_model": "mini-lm"}"#,
        );
        let options = SyncConfig::load_with(repo.path(), None, no_env)
            .unwrap()
            .sync_options();
        assert_eq!(options.checkout_policy, CheckoutPolicy::CommitFirst);
        assert_eq!(options.embedding_model.as_deref(), Some("mini-lm"));
    }

    #[test]
    fn test_resolve_repo_path_with_explicit() {
        let explicit = PathBuf::from("/custom/repo");
        assert_eq!(resolve_repo_path(Some(&explicit)).unwrap(), explicit);
    }
}
