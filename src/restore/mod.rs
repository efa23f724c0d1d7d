pub(crate) mod db_restore;
pub(crate) mod logic;
pub(crate) mod source;
pub(crate) mod validate;

use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup::BackupEngine;
use crate::config::RestoreConfig;
use crate::dump::FilterMode;
use crate::errors::PipelineError;
use crate::remote::RemoteSync;
use crate::utils::setting::check_db_connection;
use crate::verify::CheckStatus;
use crate::verify::inspector::PgConnector;
use db_restore::{MAINTENANCE_DB, PgAdmin, PsqlApplier};
pub use logic::{RestoreEngine, RestoreOutcome, RestoreRequest, StdinConfirmer};

/// Where the artifact to restore comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Path(PathBuf),
    /// Newest local artifact.
    Latest,
    /// Newest artifact in the bucket.
    LatestRemote,
    /// `s3://bucket/key` or a bare artifact file name.
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    SchemaOnly,
    DataOnly,
}

impl RestoreMode {
    pub fn from_flags(schema_only: bool, data_only: bool) -> Result<Self> {
        match (schema_only, data_only) {
            (true, true) => Err(PipelineError::Configuration(
                "--schema-only and --data-only are mutually exclusive".to_string(),
            )
            .into()),
            (true, false) => Ok(RestoreMode::SchemaOnly),
            (false, true) => Ok(RestoreMode::DataOnly),
            (false, false) => Ok(RestoreMode::Full),
        }
    }

    pub fn filter_mode(&self) -> FilterMode {
        match self {
            RestoreMode::Full => FilterMode::Full,
            RestoreMode::SchemaOnly => FilterMode::SchemaOnly,
            RestoreMode::DataOnly => FilterMode::DataOnly,
        }
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreMode::Full => "full",
            RestoreMode::SchemaOnly => "schema only",
            RestoreMode::DataOnly => "data only",
        })
    }
}

/// Public entry point for `dbvault restore`.
pub async fn run_restore_flow(config: &RestoreConfig) -> Result<()> {
    let remote = match &config.storage.s3 {
        Some(s3) => Some(RemoteSync::connect(s3).await),
        None => None,
    };

    if config.list_only {
        return source::list_backups(&config.storage.backup_dir, remote.as_ref()).await;
    }

    let request = RestoreRequest::from_config(config);
    if !request.dry_run {
        check_db_connection(&config.connection.for_database(MAINTENANCE_DB)).await?;
    }

    let pre_backup = if request.pre_backup && !request.dry_run {
        match BackupEngine::from_tools(&config.storage) {
            Ok(engine) => Some(engine),
            Err(e) => {
                tracing::warn!("Pre-restore backup unavailable: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let engine = RestoreEngine::new(
        Arc::new(PgAdmin::new(&config.connection)),
        Arc::new(PsqlApplier),
        Arc::new(StdinConfirmer),
        Arc::new(PgConnector),
        pre_backup,
    );

    match engine.run(&request, remote.as_ref()).await? {
        RestoreOutcome::DryRun { origin, report } => {
            if report.anomaly.is_some() {
                tracing::warn!("{} is structurally incomplete; a restore would apply it as is", origin);
            }
            crate::success!("Dry run of {} completed, nothing was changed", origin);
        }
        RestoreOutcome::Completed {
            origin,
            applied,
            pre_backup,
            verification,
        } => {
            if let Some(path) = pre_backup {
                tracing::info!("Previous state of {} saved in {}", request.target.database, path.display());
            }
            if let Some(status) = verification.filter(|s| *s != CheckStatus::Pass) {
                tracing::warn!("Post-restore checks ended with {}", status);
            }
            crate::success!(
                "Restore of {} into {} completed ({} lines applied)",
                origin,
                request.target.database,
                applied.lines_emitted
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Command, exit_code_for};

    #[test]
    fn test_mode_flags_are_exclusive() {
        assert_eq!(RestoreMode::from_flags(false, false).unwrap(), RestoreMode::Full);
        assert_eq!(RestoreMode::from_flags(true, false).unwrap().filter_mode(), FilterMode::SchemaOnly);
        assert_eq!(RestoreMode::from_flags(false, true).unwrap().filter_mode(), FilterMode::DataOnly);
        let err = RestoreMode::from_flags(true, true).unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 2);
    }
}
