//! Changes command: list uncommitted local changes.

use colored::Colorize;

use super::{print_json, Manager};
use crate::error::Result;

/// Execute the changes command.
///
/// # Errors
///
/// Returns an error if either store cannot be read.
pub fn execute(manager: &Manager, collection: Option<&str>, json: bool) -> Result<()> {
    let report = manager.get_local_changes(collection)?;
    if json {
        return print_json(&report);
    }

    if report.total == 0 {
        println!("No local changes on {}.", report.branch.cyan());
        return Ok(());
    }

    println!("Local changes on {}:", report.branch.cyan());
    for summary in &report.collections {
        println!();
        println!("  {}", summary.collection.bold());
        for id in &summary.new {
            println!("    {} {id}", "new     ".green());
        }
        for id in &summary.modified {
            println!("    {} {id}", "modified".yellow());
        }
        for id in &summary.deleted {
            println!("    {} {id}", "deleted ".red());
        }
    }

    let pending = &report.collection_changes;
    if pending.has_changes() {
        println!();
        println!("  {}", "Collections".bold());
        for d in &pending.deleted {
            let how = if d.tracked { "" } else { " (untracked)" };
            println!("    {} {}{how}", "deleted ".red(), d.name);
        }
        for r in &pending.renamed {
            println!("    {} {} -> {}", "renamed ".blue(), r.old_name, r.new_name);
        }
        for u in &pending.updated {
            println!("    {} {}", "metadata".yellow(), u.name);
        }
    }
    println!();
    println!("  {}: {}", "Total".bold(), report.total);
    Ok(())
}
