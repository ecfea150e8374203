//! Branch command implementations.

use colored::Colorize;
use serde::Serialize;

use super::{print_json, Manager};
use crate::cli::BranchCommands;
use crate::error::Result;

#[derive(Serialize)]
struct BranchListOutput {
    current: String,
    branches: Vec<String>,
}

#[derive(Serialize)]
struct BranchDeleteOutput<'a> {
    deleted: &'a str,
    sync_states_removed: usize,
}

/// Execute branch commands.
///
/// # Errors
///
/// Returns an error if the versioned store rejects the operation.
pub fn execute(manager: &mut Manager, command: &BranchCommands, json: bool) -> Result<()> {
    match command {
        BranchCommands::List => {
            let output = BranchListOutput {
                current: manager.versioned().current_branch()?,
                branches: manager.list_branches()?,
            };
            if json {
                return print_json(&output);
            }
            for branch in &output.branches {
                if *branch == output.current {
                    println!("* {}", branch.green());
                } else {
                    println!("  {branch}");
                }
            }
            Ok(())
        }
        BranchCommands::Create { name, from } => {
            manager.create_branch(name, from.as_deref())?;
            if json {
                return print_json(&serde_json::json!({ "created": name, "from": from }));
            }
            println!("Created branch {}", name.cyan());
            Ok(())
        }
        BranchCommands::Delete { name, force } => {
            let removed = manager.delete_branch(name, *force)?;
            if json {
                return print_json(&BranchDeleteOutput {
                    deleted: name,
                    sync_states_removed: removed,
                });
            }
            println!("Deleted branch {name} ({removed} sync state record(s) removed)");
            Ok(())
        }
    }
}
