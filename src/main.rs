//! branchsync CLI entry point.

use bsync::cli::commands::{self, open_manager};
use bsync::cli::{Cli, Commands};
use bsync::error::Error;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    // Commands that need no stores
    match &cli.command {
        Commands::Version => return commands::version::execute(json),
        Commands::Completions { shell } => return commands::completions::execute(shell),
        _ => {}
    }

    let (mut manager, config) = open_manager(cli)?;
    match &cli.command {
        Commands::Init => commands::init::execute(&mut manager, &config, json),
        Commands::Commit { message, no_stage } => {
            commands::commit::execute(&mut manager, message, *no_stage, json)
        }
        Commands::Checkout {
            branch,
            create,
            policy,
        } => commands::checkout::execute(&mut manager, branch, *create, policy.as_deref(), json),
        Commands::FullSync { collection } => {
            commands::full_sync::execute(&mut manager, collection, json)
        }
        Commands::Status => commands::status::execute(&manager, json),
        Commands::Changes { collection } => {
            commands::changes::execute(&manager, collection.as_deref(), json)
        }
        Commands::Merge { command } => commands::merge::execute(&mut manager, command, json),
        Commands::Branch { command } => commands::branch::execute(&mut manager, command, json),
        Commands::State { command } => commands::state::execute(&mut manager, command, json),
        Commands::Doc { command } => commands::doc::execute(&mut manager, command, json),
        Commands::Collection { command } => {
            commands::collection::execute(&mut manager, command, json)
        }
        Commands::Version | Commands::Completions { .. } => Ok(()),
    }
}
