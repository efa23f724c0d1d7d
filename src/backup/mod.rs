pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod metrics;
pub(crate) mod retention;

use anyhow::Result;

use crate::artifact::{BackupArtifact, integrity};
use crate::config::BackupConfig;
use crate::errors::PipelineError;
use crate::remote::RemoteSync;
use crate::utils::setting::check_db_connection;
pub use logic::{BackupEngine, BackupRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(String),
    Skipped,
    Failed(String),
}

impl std::fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadOutcome::Uploaded(key) => write!(f, "uploaded to {}", key),
            UploadOutcome::Skipped => f.write_str("upload skipped"),
            UploadOutcome::Failed(reason) => write!(f, "upload failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub artifact: BackupArtifact,
    pub removed: usize,
    pub upload: UploadOutcome,
}

/// Public entry point for `dbvault backup`.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<BackupSummary> {
    tracing::info!(
        "Starting {} backup of {}",
        config.tier,
        config.connection.describe()
    );
    check_db_connection(&config.connection).await?;

    let engine = BackupEngine::from_tools(&config.storage)?;
    let remote = match &config.storage.s3 {
        Some(s3) => Some(RemoteSync::connect(s3).await),
        None => None,
    };
    let summary = perform_backup_orchestration(config, &engine, remote.as_ref()).await?;

    crate::success!(
        "Backup completed: {} ({} bytes, {:.1}s), {} expired removed, {}",
        summary.artifact.path.display(),
        summary.artifact.size_bytes,
        summary.artifact.duration_seconds,
        summary.removed,
        summary.upload
    );
    Ok(summary)
}

/// Create, optionally verify, sweep, upload, then record metrics.
pub async fn perform_backup_orchestration(
    config: &BackupConfig,
    engine: &BackupEngine,
    remote: Option<&RemoteSync>,
) -> Result<BackupSummary> {
    let request = BackupRequest {
        connection: config.connection.clone(),
        tier: config.tier,
        schema_only: config.schema_only,
        backup_dir: config.storage.backup_dir.clone(),
    };
    let artifact = engine.create(&request).await?;

    if config.verify_after {
        let path = artifact.path.clone();
        let report = tokio::task::spawn_blocking(move || integrity::check_artifact(&path))
            .await
            .map_err(|e| PipelineError::Verification(format!("verification task failed: {}", e)))?
            .map_err(|e| PipelineError::Verification(format!("{:#}", e)))?;
        tracing::info!(
            "Backup verified: {} bytes, checksum {:?}",
            report.size_bytes,
            report.checksum
        );
    }

    let removed = retention::sweep(
        &config.storage.backup_dir,
        &config.connection.database,
        config.tier,
        config.storage.retention.days_for(config.tier),
    )?;
    if removed > 0 {
        tracing::info!("Retention removed {} expired {} backup(s)", removed, config.tier);
    }

    let upload = match remote {
        None => {
            tracing::warn!("BACKUP_S3_BUCKET is not set, skipping off-site upload");
            UploadOutcome::Skipped
        }
        Some(remote) => match remote.upload(&artifact).await {
            Ok(key) => {
                tracing::info!("Uploaded backup to {}", key);
                UploadOutcome::Uploaded(key)
            }
            Err(e) => {
                // The local artifact is intact, so the run still succeeds.
                tracing::warn!("{:#}", e);
                UploadOutcome::Failed(format!("{:#}", e))
            }
        },
    };

    if let Some(dir) = &config.metrics_dir {
        match metrics::write_textfile(dir, &artifact) {
            Ok(path) => tracing::debug!("Metrics written to {}", path.display()),
            Err(e) => tracing::warn!("Could not write backup metrics: {:#}", e),
        }
    }

    Ok(BackupSummary {
        artifact,
        removed,
        upload,
    })
}
