// dbvault/src/backup/logic.rs
use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::archive::{Compressor, select_compressor};
use super::db_dump::{Dumper, PgDump};
use crate::artifact::{ArtifactMetadata, ArtifactName, BackupArtifact, Tier, checksum, sidecars};
use crate::config::{ConnectionConfig, StorageSettings};
use crate::errors::PipelineError;

/// One backup to take.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub connection: ConnectionConfig,
    pub tier: Tier,
    pub schema_only: bool,
    pub backup_dir: PathBuf,
}

/// Deletes a half-written artifact and its sidecars unless committed.
struct PartialArtifact {
    path: PathBuf,
    committed: bool,
}

impl PartialArtifact {
    fn new(path: PathBuf) -> Self {
        Self { path, committed: false }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in std::iter::once(self.path.clone()).chain(sidecars(&self.path)) {
            if path.exists() {
                match fs::remove_file(&path) {
                    Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
                    Err(e) => tracing::warn!("Could not remove partial file {}: {}", path.display(), e),
                }
            }
        }
    }
}

/// Dump, compress, checksum and describe one database.
pub struct BackupEngine {
    dumper: Arc<dyn Dumper>,
    compressor: Arc<dyn Compressor>,
}

impl BackupEngine {
    pub fn new(dumper: Arc<dyn Dumper>, compressor: Arc<dyn Compressor>) -> Self {
        Self { dumper, compressor }
    }

    /// `pg_dump` from PATH plus the compressor the storage settings ask for.
    pub fn from_tools(storage: &StorageSettings) -> Result<Self> {
        let dumper = PgDump::locate().map_err(|e| PipelineError::BackupCreation(format!("{:#}", e)))?;
        let compressor: Arc<dyn Compressor> =
            Arc::from(select_compressor(storage.compression_level, storage.parallel_workers));
        Ok(Self::new(Arc::new(dumper), compressor))
    }

    pub async fn create(&self, request: &BackupRequest) -> Result<BackupArtifact> {
        let dumper = Arc::clone(&self.dumper);
        let compressor = Arc::clone(&self.compressor);
        let request = request.clone();
        tokio::task::spawn_blocking(move || create_blocking(dumper.as_ref(), compressor.as_ref(), &request))
            .await
            .context("Backup task panicked")?
    }
}

fn create_blocking(dumper: &dyn Dumper, compressor: &dyn Compressor, request: &BackupRequest) -> Result<BackupArtifact> {
    fs::create_dir_all(&request.backup_dir).map_err(|e| {
        PipelineError::BackupCreation(format!(
            "cannot create backup directory {}: {}",
            request.backup_dir.display(),
            e
        ))
    })?;

    let created_at = Local::now();
    let name = ArtifactName::new(
        &request.connection.database,
        request.tier,
        created_at.naive_local(),
        request.schema_only,
    );
    let path = name.path(&request.backup_dir);
    tracing::info!(
        "Creating {} backup of {} -> {} ({})",
        request.tier,
        request.connection.describe(),
        path.display(),
        compressor.describe()
    );

    let guard = PartialArtifact::new(path.clone());
    let started = Instant::now();
    let artifact = write_artifact(dumper, compressor, request, &path, created_at, started)
        .map_err(|e| PipelineError::BackupCreation(format!("{:#}", e)))?;
    guard.commit();
    Ok(artifact)
}

fn write_artifact(
    dumper: &dyn Dumper,
    compressor: &dyn Compressor,
    request: &BackupRequest,
    path: &Path,
    created_at: chrono::DateTime<Local>,
    started: Instant,
) -> Result<BackupArtifact> {
    let output = File::create(path).with_context(|| format!("Failed to create backup file: {}", path.display()))?;
    let mut stream = dumper.open(&request.connection, request.schema_only)?;
    let compressed = compressor.compress(&mut stream, output);
    // Reap the producer before looking at the compressor result.
    let finished = stream.finish();
    let consumed = compressed?;
    finished?;

    if consumed == 0 {
        anyhow::bail!("dump of {} produced no output", request.connection.database);
    }
    let size_bytes = fs::metadata(path)
        .with_context(|| format!("Failed to stat backup file: {}", path.display()))?
        .len();
    if size_bytes == 0 {
        anyhow::bail!("backup file {} is empty", path.display());
    }

    let checksum_sha256 = checksum::write_sidecar(path)?;
    let duration_seconds = started.elapsed().as_secs_f64();

    let artifact = BackupArtifact {
        path: path.to_path_buf(),
        database: request.connection.database.clone(),
        tier: request.tier,
        schema_only: request.schema_only,
        created_at,
        size_bytes,
        duration_seconds,
        checksum_sha256,
    };

    ArtifactMetadata {
        backup_file: artifact.file_name(),
        database: artifact.database.clone(),
        host: request.connection.host.clone(),
        port: request.connection.port,
        user: request.connection.user.clone(),
        tier: artifact.tier,
        schema_only: artifact.schema_only,
        created_at: created_at.to_rfc3339(),
        created_at_unix: created_at.timestamp(),
        duration_seconds,
        size_bytes,
        tool_version: dumper.version(),
        script_version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
    }
    .write(path)?;

    tracing::info!(
        "Backup written: {} ({} bytes compressed from {} bytes in {:.1}s)",
        path.display(),
        size_bytes,
        consumed,
        duration_seconds
    );
    Ok(artifact)
}
