//! Status command implementation.

use super::{print_json, Manager};
use crate::error::Result;
use crate::sync::print_status;

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if either store cannot be read.
pub fn execute(manager: &Manager, json: bool) -> Result<()> {
    let status = manager.get_status()?;
    if json {
        print_json(&status)
    } else {
        print_status(&status);
        Ok(())
    }
}
