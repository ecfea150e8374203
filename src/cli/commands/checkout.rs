//! Checkout command: switch branches and reconcile the document store.

use colored::Colorize;

use super::{print_json, short_hash, Manager};
use crate::error::{Error, Result};
use crate::sync::{CheckoutOutcome, CheckoutReport};
use crate::validate::parse_checkout_policy;

/// Execute the checkout command.
///
/// # Errors
///
/// Returns an error for an invalid policy or a failed switch, when local
/// changes block the checkout, and when any collection failed to reconcile.
pub fn execute(
    manager: &mut Manager,
    branch: &str,
    create: bool,
    policy: Option<&str>,
    json: bool,
) -> Result<()> {
    let policy = policy.map(parse_checkout_policy).transpose()?;
    let outcome = manager.process_checkout(branch, create, policy)?;
    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }

    outcome_result(outcome)
}

/// Anything short of a clean reconcile still exits non-zero for scripts.
fn outcome_result(outcome: CheckoutOutcome) -> Result<()> {
    match outcome {
        CheckoutOutcome::Completed(report) | CheckoutOutcome::Failed(report) => {
            report.reconcile.partial_failure().map_or(Ok(()), Err)
        }
        CheckoutOutcome::Aborted {
            local_changes,
            collections,
            ..
        } => Err(Error::LocalChangesExist {
            count: local_changes,
            collections,
        }),
    }
}

fn print_outcome(outcome: &CheckoutOutcome) {
    match outcome {
        CheckoutOutcome::Completed(report) => print_report(report),
        CheckoutOutcome::Aborted {
            branch,
            target,
            local_changes,
            ..
        } => {
            println!(
                "{} Staying on {}: {} local change(s) would be lost switching to {}.",
                "Aborted.".yellow(),
                branch.cyan(),
                local_changes,
                target
            );
            println!(
                "{}",
                "Commit them, or pass --policy commit_first | carry | reset_first.".dimmed()
            );
        }
        CheckoutOutcome::Failed(report) => {
            print_report(report);
            println!("{}", "No collection could be reconciled.".red());
        }
    }
}

fn print_report(report: &CheckoutReport) {
    let verb = if report.created_branch {
        "Created and switched to"
    } else {
        "Switched to"
    };
    print!("{verb} {} from {}", report.to_branch.cyan(), report.from_branch);
    match &report.head {
        Some(head) => println!(" ({})", short_hash(head)),
        None => println!(),
    }
    if let Some(pre) = &report.pre_commit {
        println!("  committed local changes first as {}", short_hash(pre));
    }
    for c in &report.reconcile.collections {
        if c.changed() == 0 && c.preserved == 0 {
            continue;
        }
        println!(
            "  {:<24} +{} ~{} -{} ({} kept local)",
            c.collection,
            c.added,
            c.updated + c.metadata_updated,
            c.deleted,
            c.preserved
        );
    }
    for removed in &report.reconcile.removed {
        println!("  removed collection {removed}");
    }
    for failure in &report.reconcile.failed {
        println!("  {} {}: {}", "failed".red(), failure.collection, failure.error);
    }
    if !report.reconcile.cancelled.is_empty() {
        println!("  cancelled before: {}", report.reconcile.cancelled.join(", "));
    }
}
