//! Full-sync command: rebuild one collection from the current branch.

use super::{print_json, short_hash, Manager};
use crate::error::Result;

/// Execute the full-sync command.
///
/// # Errors
///
/// Returns an error if either store fails.
pub fn execute(manager: &mut Manager, collection: &str, json: bool) -> Result<()> {
    let report = manager.full_sync(collection)?;
    if json {
        return print_json(&report);
    }

    let action = if report.created_collection {
        "Created"
    } else {
        "Rebuilt"
    };
    println!(
        "{action} {} from {} ({}): {} document(s), {} stale entr(ies) cleared",
        report.collection,
        report.branch,
        report.commit.as_deref().map_or("-", short_hash),
        report.added,
        report.cleared
    );
    Ok(())
}
