//! dbvault: PostgreSQL backup, restore and verification pipeline.
//!
//! Exit codes are per command; see `errors::PipelineError::exit_code`.

// dbvault/src/main.rs
mod artifact;
mod backup;
mod config;
mod dump;
mod errors;
mod remote;
mod restore;
mod utils;
mod verify;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use config::cli::{Cli, Commands};
use config::{EnvSource, load_backup_config, load_restore_config, load_verify_config};
use errors::{Command, exit_code_for};
use utils::logging::{self, Verbosity};
use verify::VerificationReport;

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal in production.
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let (verbosity, command, json) = match &cli.command {
        Commands::Backup(args) => (verbosity(args.verbose, false), Command::Backup, false),
        Commands::Restore(args) => (verbosity(args.verbose, false), Command::Restore, false),
        Commands::Verify(args) => (verbosity(args.verbose, args.json), Command::Verify, args.json),
    };
    logging::init(verbosity);

    tokio::select! {
        code = run(cli.command) => match code {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                tracing::error!("{:#}", e);
                let code = exit_code_for(&e, command);
                if json {
                    println!("{}", VerificationReport::error_json(&format!("{:#}", e), code));
                }
                ExitCode::from(code)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

fn verbosity(verbose: bool, json: bool) -> Verbosity {
    if json {
        Verbosity::Quiet
    } else if verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    }
}

async fn run(command: Commands) -> Result<u8> {
    let env = EnvSource::process();
    match command {
        Commands::Backup(args) => {
            let config = load_backup_config(&env, &args)?;
            backup::run_backup_flow(&config).await?;
            Ok(0)
        }
        Commands::Restore(args) => {
            let config = load_restore_config(&env, &args)?;
            restore::run_restore_flow(&config).await?;
            Ok(0)
        }
        Commands::Verify(args) => {
            let config = load_verify_config(&env, &args)?;
            let report = verify::run_verify_flow(&config).await?;
            Ok(report.exit_code())
        }
    }
}
