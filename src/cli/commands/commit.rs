//! Commit command: stage local changes and commit them.

use colored::Colorize;

use super::{print_json, short_hash, Manager};
use crate::error::Result;
use crate::sync::CommitOutcome;

/// Execute the commit command.
///
/// "Nothing to commit" is reported, not treated as a failure.
///
/// # Errors
///
/// Returns an error if staging or committing fails.
pub fn execute(manager: &mut Manager, message: &str, no_stage: bool, json: bool) -> Result<()> {
    let outcome = manager.process_commit(message, !no_stage)?;
    if json {
        return print_json(&outcome);
    }

    match outcome {
        CommitOutcome::Committed(report) => {
            println!(
                "{} {} on {}",
                "Committed".green(),
                short_hash(&report.hash),
                report.branch.cyan()
            );
            for c in report.collections.iter().filter(|c| c.total() > 0) {
                println!(
                    "  {:<24} +{} ~{} -{}",
                    c.collection, c.added, c.modified, c.deleted
                );
            }
            let changes = &report.collection_changes;
            for (name, rows) in &changes.deleted {
                println!("  deleted collection {name} ({rows} document(s))");
            }
            for (old, new) in &changes.renamed {
                println!("  renamed collection {old} -> {new}");
            }
            for name in &changes.updated {
                println!("  updated metadata of {name}");
            }
        }
        CommitOutcome::NoChanges { branch } => {
            println!("Nothing to commit on {}.", branch.cyan());
        }
    }
    Ok(())
}
