//! CLI definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;

/// Versioned store backend.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// Dolt repository driven through the `dolt` executable
    #[default]
    Dolt,
    /// Embedded snapshot store under `<repo>/.branchsync/versioned`
    Snapshot,
}

/// branchsync - keep a document store in step with a versioned SQL store
#[derive(Parser, Debug)]
#[command(name = "bsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Versioned repository path (default: current directory)
    #[arg(long, global = true, env = "BSYNC_REPO")]
    pub repo: Option<PathBuf>,

    /// Versioned store backend
    #[arg(long, value_enum, global = true, env = "BSYNC_BACKEND", default_value_t)]
    pub backend: Backend,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the versioned repository and sync tables
    Init,

    /// Print version information
    Version,

    /// Stage local document changes and commit them
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Commit only what is already staged in the versioned store
        #[arg(long)]
        no_stage: bool,
    },

    /// Switch branches and reconcile the document store
    Checkout {
        /// Target branch
        branch: String,

        /// Create the branch from HEAD first
        #[arg(short = 'b', long)]
        create: bool,

        /// What to do with local changes (abort, commit_first, carry, reset_first)
        #[arg(long)]
        policy: Option<String>,
    },

    /// Rebuild a collection in the document store from the current branch
    FullSync {
        /// Collection name
        collection: String,
    },

    /// Show sync status of every collection
    Status,

    /// List uncommitted local changes
    Changes {
        /// Restrict to one collection
        collection: Option<String>,
    },

    /// Merge branches with conflict analysis
    Merge {
        #[command(subcommand)]
        command: MergeCommands,
    },

    /// Branch management
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },

    /// Local sync state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Document operations (tracked as local changes)
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },

    /// Collection operations (tracked as local changes)
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Merge Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum MergeCommands {
    /// Show what a merge would change and which rows conflict
    Preview {
        /// Branch to merge from
        source: String,

        /// Branch to merge into (default: current branch)
        #[arg(long)]
        into: Option<String>,
    },

    /// Merge, applying conflict resolutions
    Execute {
        /// Branch to merge from
        source: String,

        /// Branch to merge into (default: current branch)
        #[arg(long)]
        into: Option<String>,

        /// Resolution for one conflict: `<conflict_id>=ours|theirs`
        #[arg(long = "resolve", value_name = "ID=RESOLUTION")]
        resolutions: Vec<String>,

        /// Resolve remaining conflicts with the configured default
        #[arg(long)]
        auto: bool,
    },
}

// ============================================================================
// Branch Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum BranchCommands {
    /// List branches
    List,

    /// Create a branch without switching to it
    Create {
        /// Branch name
        name: String,

        /// Start point (default: HEAD)
        #[arg(long)]
        from: Option<String>,
    },

    /// Delete a branch and its sync state
    Delete {
        /// Branch name
        name: String,

        /// Delete even if not merged
        #[arg(short, long)]
        force: bool,
    },
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List sync state records for this repository
    List,

    /// Recompute sync state for a branch from the stores
    Reconstruct {
        /// Branch (default: current branch)
        #[arg(long)]
        branch: Option<String>,
    },

    /// Show the sync event log
    Events {
        /// Maximum events to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

// ============================================================================
// Document Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum DocCommands {
    /// Add (or replace) a document
    Add {
        /// Collection name (created if missing)
        collection: String,

        /// Document id
        id: String,

        /// Document content
        content: String,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Replace a document's content
    Update {
        /// Collection name
        collection: String,

        /// Document id
        id: String,

        /// New content
        content: String,
    },

    /// Delete documents
    Delete {
        /// Collection name
        collection: String,

        /// Document ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List documents of a collection
    List {
        /// Collection name
        collection: String,
    },

    /// Rank entries of a collection against a text query
    Search {
        /// Collection name
        collection: String,

        /// Query text
        query: String,

        /// Maximum hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

// ============================================================================
// Collection Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum CollectionCommands {
    /// List collections in the document store
    List,

    /// Create an empty collection
    Create {
        /// Collection name
        name: String,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Delete a collection
    Delete {
        /// Collection name
        name: String,
    },

    /// Rename a collection
    Rename {
        /// Current name
        old_name: String,

        /// New name
        new_name: String,
    },

    /// Replace a collection's metadata
    SetMetadata {
        /// Collection name
        name: String,

        /// Metadata as a JSON object
        metadata: String,
    },
}
