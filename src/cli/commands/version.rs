//! Version command implementation.

use serde::Serialize;

use super::print_json;
use crate::error::Result;

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    build: &'static str,
    backends: [&'static str; 2],
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let output = VersionOutput {
        name: "bsync",
        version: env!("CARGO_PKG_VERSION"),
        build: if cfg!(debug_assertions) { "dev" } else { "release" },
        backends: ["dolt", "snapshot"],
    };

    if json {
        return print_json(&output);
    }
    println!("{} {} ({})", output.name, output.version, output.build);
    Ok(())
}
