// dbvault/src/config/cli.rs
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::artifact::Tier;

/// PostgreSQL backup, restore and verification pipeline
#[derive(Debug, Parser)]
#[command(name = "dbvault", author, version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a compressed, checksummed backup of POSTGRES_DB
    Backup(BackupArgs),
    /// Restore a backup into a target database
    Restore(RestoreArgs),
    /// Run integrity checks against a live database
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Args)]
pub struct BackupArgs {
    /// Retention tier of the new backup
    #[arg(long = "type", value_enum, default_value_t = Tier::Daily)]
    pub tier: Tier,

    /// Dump schema only, no table data
    #[arg(long)]
    pub schema_only: bool,

    /// Verify the artifact after it has been written
    #[arg(long)]
    pub verify: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Args)]
pub struct RestoreArgs {
    /// Backup file path, file name in BACKUP_DIR, or remote reference with --from-s3
    #[arg(value_name = "BACKUP_FILE")]
    pub backup_file: Option<String>,

    /// List available backups and exit
    #[arg(long)]
    pub list: bool,

    /// Restore the most recent backup
    #[arg(long, conflicts_with = "backup_file")]
    pub latest: bool,

    /// Fetch the backup from the configured S3 bucket
    #[arg(long)]
    pub from_s3: bool,

    /// Analyse the backup without touching any database
    #[arg(long)]
    pub dry_run: bool,

    /// Restore only schema objects
    #[arg(long, conflicts_with = "data_only")]
    pub schema_only: bool,

    /// Restore only table data
    #[arg(long)]
    pub data_only: bool,

    /// Drop and recreate the public schema before restoring
    #[arg(long)]
    pub drop: bool,

    /// Database to restore into (defaults to POSTGRES_DB)
    #[arg(long, value_name = "NAME")]
    pub target_db: Option<String>,

    /// Do not ask for confirmation
    #[arg(long)]
    pub skip_confirm: bool,

    /// Skip the safety backup of the target database
    #[arg(long)]
    pub no_pre_backup: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    /// Only run table and row-level-security checks
    #[arg(long)]
    pub quick: bool,

    /// Cross-check the live database against a backup file
    #[arg(long, value_name = "FILE")]
    pub compare: Option<PathBuf>,

    /// Print a single JSON object instead of log lines
    #[arg(long)]
    pub json: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_type_flag() {
        let cli = Cli::try_parse_from(["dbvault", "backup", "--type=weekly", "--schema-only"]).unwrap();
        match cli.command {
            Commands::Backup(args) => {
                assert_eq!(args.tier, Tier::Weekly);
                assert!(args.schema_only);
                assert!(!args.verify);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_version_flag_on_subcommands() {
        let err = Cli::try_parse_from(["dbvault", "backup", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        let err = Cli::try_parse_from(["dbvault", "verify", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_restore_modes_are_exclusive() {
        let result = Cli::try_parse_from(["dbvault", "restore", "x.sql.gz", "--schema-only", "--data-only"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_restore_latest_conflicts_with_file() {
        let result = Cli::try_parse_from(["dbvault", "restore", "x.sql.gz", "--latest"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from(["dbvault", "restore", "--latest", "--target-db=staging", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Restore(args) => {
                assert!(args.latest);
                assert!(args.dry_run);
                assert_eq!(args.target_db.as_deref(), Some("staging"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
