// dbvault/src/restore/logic.rs
use anyhow::{Context, Result};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::db_restore::{DatabaseAdmin, MAINTENANCE_DB, SqlApplier, remediation_hints};
use super::source::{self, ResolvedArtifact};
use super::validate::validate_artifact;
use super::{RestoreMode, RestoreSource};
use crate::artifact::Tier;
use crate::backup::archive::open_decompressed;
use crate::backup::{BackupEngine, BackupRequest};
use crate::config::{ConnectionConfig, RestoreConfig};
use crate::dump::{DryRunReport, FilterMode, FilterSummary, analyze_artifact, filter_stream};
use crate::errors::PipelineError;
use crate::remote::RemoteSync;
use crate::verify::inspector::InspectorConnector;
use crate::verify::{CheckStatus, VerificationEngine, VerifyMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Resolve,
    Validate,
    DryRun,
    Confirm,
    PreBackup,
    Apply,
    Verify,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStage::Resolve => "RESOLVE",
            RestoreStage::Validate => "VALIDATE",
            RestoreStage::DryRun => "DRY RUN",
            RestoreStage::Confirm => "CONFIRM",
            RestoreStage::PreBackup => "PRE-BACKUP",
            RestoreStage::Apply => "APPLY",
            RestoreStage::Verify => "VERIFY",
        })
    }
}

/// Asks the operator a question and returns the raw answer.
pub trait Confirmer: Send + Sync {
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompts on stderr, reads one line from stdin.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn ask(&self, prompt: &str) -> Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{}", prompt)?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read confirmation from stdin")?;
        Ok(answer)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub source: RestoreSource,
    /// POSTGRES_DB; `--latest` prefers its backups over the target's own.
    pub source_database: String,
    /// Connection to the database being restored into.
    pub target: ConnectionConfig,
    pub mode: RestoreMode,
    pub drop_existing: bool,
    pub dry_run: bool,
    pub skip_confirm: bool,
    pub pre_backup: bool,
    pub backup_dir: PathBuf,
    pub core_tables: Vec<String>,
}

impl RestoreRequest {
    pub fn from_config(config: &RestoreConfig) -> Self {
        Self {
            source: config.source.clone(),
            source_database: config.connection.database.clone(),
            target: config.connection.for_database(&config.target_database),
            mode: config.mode,
            drop_existing: config.drop_existing,
            dry_run: config.dry_run,
            skip_confirm: config.skip_confirm,
            pre_backup: config.pre_backup,
            backup_dir: config.storage.backup_dir.clone(),
            core_tables: config.core_tables.clone(),
        }
    }
}

#[derive(Debug)]
pub enum RestoreOutcome {
    DryRun {
        origin: String,
        report: DryRunReport,
    },
    Completed {
        origin: String,
        applied: FilterSummary,
        pre_backup: Option<PathBuf>,
        verification: Option<CheckStatus>,
    },
}

/// Resolve, validate, then either analyse or confirm, back up, apply and verify.
pub struct RestoreEngine {
    admin: Arc<dyn DatabaseAdmin>,
    applier: Arc<dyn SqlApplier>,
    confirmer: Arc<dyn Confirmer>,
    connector: Arc<dyn InspectorConnector>,
    backup: Option<BackupEngine>,
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.context("Restore task panicked")?
}

fn enter(stage: RestoreStage) {
    tracing::info!("== {} ==", stage);
}

impl RestoreEngine {
    pub fn new(
        admin: Arc<dyn DatabaseAdmin>,
        applier: Arc<dyn SqlApplier>,
        confirmer: Arc<dyn Confirmer>,
        connector: Arc<dyn InspectorConnector>,
        backup: Option<BackupEngine>,
    ) -> Self {
        Self {
            admin,
            applier,
            confirmer,
            connector,
            backup,
        }
    }

    pub async fn run(&self, request: &RestoreRequest, remote: Option<&RemoteSync>) -> Result<RestoreOutcome> {
        let target = &request.target.database;
        if request.drop_existing && !request.dry_run && target.eq_ignore_ascii_case(MAINTENANCE_DB) {
            return Err(PipelineError::Configuration(format!(
                "refusing to restore with --drop into the '{}' maintenance database",
                MAINTENANCE_DB
            ))
            .into());
        }

        enter(RestoreStage::Resolve);
        // Held until the run ends so a downloaded artifact outlives every stage.
        let resolved = source::resolve(
            &request.source,
            &request.backup_dir,
            &request.source_database,
            remote,
        )
        .await?;
        tracing::info!("Restoring from {}", resolved.origin);

        enter(RestoreStage::Validate);
        let path = resolved.path.clone();
        blocking(move || validate_artifact(&path)).await?;

        if request.dry_run {
            enter(RestoreStage::DryRun);
            let path = resolved.path.clone();
            let report = blocking(move || analyze_artifact(&path)).await?;
            report.log();
            return Ok(RestoreOutcome::DryRun {
                origin: resolved.origin,
                report,
            });
        }

        if !request.skip_confirm {
            enter(RestoreStage::Confirm);
            self.confirm(request, &resolved).await?;
        }

        let exists = self.admin.database_exists(target).await?;

        enter(RestoreStage::PreBackup);
        let pre_backup = self.pre_backup(request, exists).await;

        enter(RestoreStage::Apply);
        let applied = self.apply(request, exists, &resolved.path).await?;

        enter(RestoreStage::Verify);
        let verification = self.verify(request).await;

        Ok(RestoreOutcome::Completed {
            origin: resolved.origin,
            applied,
            pre_backup,
            verification,
        })
    }

    async fn confirm(&self, request: &RestoreRequest, resolved: &ResolvedArtifact) -> Result<()> {
        let prompt = format!(
            "About to restore\n  backup:  {}\n  target:  {}\n  mode:    {}\n  drop:    {}\n  pre-backup: {}\n\
             This will modify the target database. Type 'yes' to continue: ",
            resolved.origin,
            request.target.describe(),
            request.mode,
            if request.drop_existing { "yes (schema public is recreated)" } else { "no" },
            if request.pre_backup { "yes" } else { "no" },
        );
        let confirmer = Arc::clone(&self.confirmer);
        let answer = blocking(move || confirmer.ask(&prompt)).await?;
        if answer.trim() != "yes" {
            tracing::warn!("Restore cancelled by user");
            return Err(PipelineError::UserCancelled.into());
        }
        Ok(())
    }

    async fn pre_backup(&self, request: &RestoreRequest, exists: bool) -> Option<PathBuf> {
        if !request.pre_backup {
            tracing::info!("Pre-restore backup disabled");
            return None;
        }
        if !exists {
            tracing::info!("Target {} does not exist yet, nothing to back up", request.target.database);
            return None;
        }
        let Some(engine) = &self.backup else {
            tracing::warn!("Skipping pre-restore backup: pg_dump is not available");
            return None;
        };
        let backup = BackupRequest {
            connection: request.target.clone(),
            tier: Tier::Daily,
            schema_only: false,
            backup_dir: request.backup_dir.clone(),
        };
        match engine.create(&backup).await {
            Ok(artifact) => {
                tracing::info!("Pre-restore backup saved to {}", artifact.path.display());
                Some(artifact.path)
            }
            Err(e) => {
                tracing::warn!("Pre-restore backup failed, continuing: {:#}", e);
                None
            }
        }
    }

    async fn apply(&self, request: &RestoreRequest, exists: bool, path: &Path) -> Result<FilterSummary> {
        let target = &request.target.database;
        if !exists {
            tracing::info!("Creating database {}", target);
            self.admin
                .create_database(target)
                .await
                .map_err(|e| PipelineError::Restore(format!("{:#}", e)))?;
        } else if request.drop_existing {
            tracing::info!("Dropping and recreating schema public in {}", target);
            self.admin
                .reset_public_schema(target)
                .await
                .map_err(|e| PipelineError::Restore(format!("{:#}", e)))?;
        }

        tracing::info!("Applying backup ({}) to {}", request.mode, request.target.describe());
        let applier = Arc::clone(&self.applier);
        let connection = request.target.clone();
        let path = path.to_path_buf();
        let mode = request.mode.filter_mode();
        let summary = blocking(move || apply_blocking(applier.as_ref(), &connection, &path, mode))
            .await
            .map_err(|e| {
                let text = format!("{:#}", e);
                for hint in remediation_hints(&text) {
                    tracing::warn!("Hint: {}", hint);
                }
                PipelineError::Restore(text)
            })?;

        if let Some(anomaly) = &summary.anomaly {
            tracing::warn!("Backup ended abnormally: {}", anomaly);
        }
        tracing::info!(
            "Applied {} of {} lines ({} COPY blocks, {} INSERT lines)",
            summary.lines_emitted,
            summary.lines_read,
            summary.copy_blocks,
            summary.insert_lines
        );
        Ok(summary)
    }

    async fn verify(&self, request: &RestoreRequest) -> Option<CheckStatus> {
        let inspector = match self.connector.connect(&request.target).await {
            Ok(inspector) => inspector,
            Err(e) => {
                tracing::warn!("Post-restore verification skipped: {:#}", e);
                return None;
            }
        };
        let engine = VerificationEngine::new(inspector.as_ref(), &request.target.database, &request.core_tables);
        match engine.run(VerifyMode::Quick).await {
            Ok(report) => {
                for check in report.non_passing() {
                    tracing::warn!("Post-restore check {} is {}: {}", check.name, check.status, check.detail);
                }
                if report.overall() == CheckStatus::Pass {
                    tracing::info!("Post-restore checks passed");
                }
                Some(report.overall())
            }
            Err(e) => {
                tracing::warn!("Post-restore verification failed to run: {:#}", e);
                None
            }
        }
    }
}

fn apply_blocking(
    applier: &dyn SqlApplier,
    connection: &ConnectionConfig,
    path: &Path,
    mode: FilterMode,
) -> Result<FilterSummary> {
    let reader = open_decompressed(path)?;
    let mut session = applier.begin(connection)?;
    let streamed = filter_stream(reader, session.as_mut(), mode);
    // A write error usually means psql stopped; its own error says why.
    session.finish()?;
    streamed.with_context(|| format!("Failed to stream {} into the database", path.display()))
}
