//! Sync state command implementations.

use chrono::{TimeZone, Utc};
use colored::Colorize;

use super::{print_json, short_hash, Manager};
use crate::cli::StateCommands;
use crate::error::Result;

fn format_time(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map_or_else(|| millis.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Execute state commands.
///
/// # Errors
///
/// Returns an error if a store cannot be read or written.
pub fn execute(manager: &mut Manager, command: &StateCommands, json: bool) -> Result<()> {
    match command {
        StateCommands::List => {
            let states = manager.sync_states();
            if json {
                return print_json(&states);
            }
            if states.is_empty() {
                println!("{}", "No sync state recorded.".dimmed());
                return Ok(());
            }
            println!(
                "{:<20} {:<24} {:<12} {:>6} {:>7}  {}",
                "BRANCH", "COLLECTION", "COMMIT", "DOCS", "CHUNKS", "STATUS"
            );
            for s in &states {
                println!(
                    "{:<20} {:<24} {:<12} {:>6} {:>7}  {}",
                    s.branch,
                    s.collection_name,
                    s.last_sync_commit.as_deref().map_or("-", short_hash),
                    s.document_count,
                    s.chunk_count,
                    s.sync_status.as_str()
                );
            }
            Ok(())
        }
        StateCommands::Reconstruct { branch } => {
            let rebuilt = manager.reconstruct_sync_state(branch.as_deref())?;
            if json {
                return print_json(&serde_json::json!({ "reconstructed": rebuilt, "branch": branch }));
            }
            if rebuilt {
                println!("{}", "Sync state reconstructed.".green());
            } else {
                println!("Branch holds no collections; nothing to reconstruct.");
            }
            Ok(())
        }
        StateCommands::Events { limit } => {
            let events = manager.events(Some(*limit));
            if json {
                return print_json(&events);
            }
            for e in &events {
                let subject = e.collection_name.as_deref().unwrap_or("");
                println!(
                    "{}  {:<20} {:<18} {:<16} {}",
                    format_time(e.created_at),
                    e.event_type.as_str(),
                    e.branch,
                    subject,
                    e.comment.as_deref().unwrap_or("").dimmed()
                );
            }
            Ok(())
        }
    }
}
