//! Merge command implementations.

use colored::Colorize;

use super::{parse_metadata, print_json, short_hash, Manager};
use crate::cli::MergeCommands;
use crate::error::{Error, Result};
use crate::sync::{ConflictResolution, MergeBlock, MergeConflict, MergeResult, ResolutionType};
use crate::validate::parse_resolution;

/// Execute merge commands.
///
/// # Errors
///
/// Returns an error if a ref cannot be read, a resolution is malformed, or
/// the merge is blocked.
pub fn execute(manager: &mut Manager, command: &MergeCommands, json: bool) -> Result<()> {
    match command {
        MergeCommands::Preview { source, into } => preview(manager, source, into.as_deref(), json),
        MergeCommands::Execute {
            source,
            into,
            resolutions,
            auto,
        } => {
            let parsed = resolutions
                .iter()
                .map(String::as_str)
                .map(parse_resolution_arg)
                .collect::<Result<Vec<_>>>()?;
            run(manager, source, into.as_deref(), &parsed, *auto, json)
        }
    }
}

/// Parse `<conflict_id>=<resolution>`.
///
/// The resolution is a strategy name (`ours`, `theirs`, ...) or a JSON
/// object of field values for a custom resolution.
fn parse_resolution_arg(arg: &str) -> Result<ConflictResolution> {
    let Some((id, value)) = arg.split_once('=') else {
        return Err(Error::Validation(format!(
            "resolution '{arg}' must look like <conflict_id>=ours|theirs|{{json}}"
        )));
    };
    let id = id.trim().to_string();
    let value = value.trim();
    if value.starts_with('{') {
        return Ok(ConflictResolution {
            conflict_id: id,
            resolution: ResolutionType::Custom,
            custom_values: Some(parse_metadata(Some(value))?),
        });
    }
    Ok(ConflictResolution {
        conflict_id: id,
        resolution: parse_resolution(value)?,
        custom_values: None,
    })
}

fn preview(manager: &Manager, source: &str, into: Option<&str>, json: bool) -> Result<()> {
    let preview = manager.preview_merge(source, into)?;
    if json {
        return print_json(&preview);
    }

    println!("Merge {} into {}", preview.source.cyan(), preview.target.cyan());
    println!(
        "  Base: {}",
        preview.merge_base.as_deref().map_or("(none)", short_hash)
    );
    println!("  Source-only changes: {}", preview.source_changes);
    println!("  Target-only changes: {}", preview.target_changes);
    println!("  Auto-mergeable rows: {}", preview.auto_mergeable.len());

    if preview.conflicts.is_empty() {
        println!("{}", "No conflicts. The merge can run unattended.".green());
        return Ok(());
    }
    println!();
    println!("{}", format!("{} conflict(s):", preview.conflicts.len()).as_str().yellow().bold());
    for conflict in &preview.conflicts {
        print_conflict(conflict);
    }
    println!();
    println!(
        "{}",
        "Resolve with: bsync merge execute <source> --resolve <id>=ours|theirs".dimmed()
    );
    Ok(())
}

fn print_conflict(conflict: &MergeConflict) {
    println!(
        "  {}  {}/{}  [{}]",
        conflict.conflict_id,
        conflict.collection_name,
        conflict.doc_id,
        conflict.fields.join(", ")
    );
}

fn run(
    manager: &mut Manager,
    source: &str,
    into: Option<&str>,
    resolutions: &[ConflictResolution],
    auto: bool,
    json: bool,
) -> Result<()> {
    let result = manager.execute_merge(source, into, resolutions, auto)?;
    if json {
        print_json(&result)?;
    }

    match result {
        MergeResult::Merged(report) => {
            if !json {
                if report.up_to_date {
                    println!("Already up to date with {}.", report.source);
                } else {
                    let how = if report.fast_forward { "Fast-forwarded" } else { "Merged" };
                    println!(
                        "{how} {} into {} ({})",
                        report.source.cyan(),
                        report.target.cyan(),
                        report.hash.as_deref().map_or("-", short_hash)
                    );
                    println!(
                        "  {} row(s) auto-merged, {} conflict(s) resolved, {} document(s) reconciled",
                        report.auto_merged,
                        report.resolved.len(),
                        report.reconcile.documents_changed()
                    );
                }
            }
            Ok(())
        }
        MergeResult::Blocked(MergeBlock::UnresolvedConflicts { conflict_ids }) => {
            Err(Error::UnresolvedConflicts {
                count: conflict_ids.len(),
                conflict_ids,
            })
        }
        MergeResult::Blocked(MergeBlock::LocalChanges { count, collections }) => {
            Err(Error::LocalChangesExist { count, collections })
        }
    }
}
