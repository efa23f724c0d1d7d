// dbvault/src/restore/source.rs
//
// Turning a restore source into a local artifact file.
use anyhow::Result;
use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::RestoreSource;
use crate::artifact::{LocalArtifact, scan_artifacts};
use crate::errors::PipelineError;
use crate::remote::{RemoteRef, RemoteSync};

/// A local artifact ready for validation. A downloaded artifact lives in a
/// scratch directory that is deleted when this value is dropped.
#[derive(Debug)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub origin: String,
    _scratch: Option<TempDir>,
}

impl ResolvedArtifact {
    fn local(path: PathBuf) -> Self {
        Self {
            origin: path.display().to_string(),
            path,
            _scratch: None,
        }
    }
}

pub async fn resolve(
    source: &RestoreSource,
    backup_dir: &Path,
    database: &str,
    remote: Option<&RemoteSync>,
) -> Result<ResolvedArtifact> {
    match source {
        RestoreSource::Path(path) => resolve_path(path, backup_dir).map(ResolvedArtifact::local),
        RestoreSource::Latest => {
            let found = scan_artifacts(backup_dir)?;
            let pick = newest_for(&found, database).ok_or_else(|| {
                PipelineError::BackupFile(format!("no backups found in {}", backup_dir.display()))
            })?;
            tracing::info!("Latest local backup: {}", pick.path.display());
            Ok(ResolvedArtifact::local(pick.path.clone()))
        }
        RestoreSource::Remote(raw) => {
            let remote = require_remote(remote)?;
            let reference = remote.parse_ref(raw)?;
            download(remote, &reference).await
        }
        RestoreSource::LatestRemote => {
            let remote = require_remote(remote)?;
            let reference = remote.latest(database).await?.ok_or_else(|| {
                PipelineError::BackupFile(format!("no backups found in {}", remote.describe()))
            })?;
            tracing::info!("Latest remote backup: {}", reference.key);
            download(remote, &reference).await
        }
    }
}

fn require_remote(remote: Option<&RemoteSync>) -> Result<&RemoteSync> {
    remote.ok_or_else(|| PipelineError::Configuration("BACKUP_S3_BUCKET is not set".to_string()).into())
}

async fn download(remote: &RemoteSync, reference: &RemoteRef) -> Result<ResolvedArtifact> {
    let scratch = tempfile::Builder::new()
        .prefix("dbvault-restore-")
        .tempdir()
        .map_err(|e| PipelineError::BackupFile(format!("cannot create download directory: {}", e)))?;
    let downloaded = remote.download(reference, scratch.path()).await?;
    Ok(ResolvedArtifact {
        path: downloaded.path,
        origin: format!("{}/{}", remote.describe(), downloaded.key),
        _scratch: Some(scratch),
    })
}

/// Accepts an existing path, or a bare file name found in the backup directory.
fn resolve_path(path: &Path, backup_dir: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    let is_bare_name = path.parent().is_none_or(|p| p.as_os_str().is_empty());
    if is_bare_name {
        let candidate = backup_dir.join(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(PipelineError::BackupFile(format!("backup file not found: {}", path.display())).into())
}

/// Newest artifact of `database`, or the newest of any database when it has none.
fn newest_for<'a>(found: &'a [LocalArtifact], database: &str) -> Option<&'a LocalArtifact> {
    found
        .iter()
        .find(|a| a.name.database == database)
        .or_else(|| found.first())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn age(modified: chrono::DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(modified);
    if elapsed.num_days() > 0 {
        format!("{}d ago", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}m ago", elapsed.num_minutes().max(0))
    }
}

/// Prints local and, when configured, remote artifacts to stdout.
pub async fn list_backups(backup_dir: &Path, remote: Option<&RemoteSync>) -> Result<()> {
    let local = scan_artifacts(backup_dir)?;
    println!("Local backups in {}:", backup_dir.display());
    if local.is_empty() {
        println!("  (none)");
    }
    for artifact in &local {
        println!(
            "  {:<56} {:<8} {:>10}  {} ({})",
            artifact.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            artifact.name.tier,
            human_size(artifact.size_bytes),
            artifact.modified_utc().with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            age(artifact.modified_utc())
        );
    }

    if let Some(remote) = remote {
        println!("Remote backups in {}:", remote.describe());
        match remote.list().await {
            Ok(objects) if objects.is_empty() => println!("  (none)"),
            Ok(objects) => {
                for object in objects {
                    let when = object
                        .object
                        .last_modified
                        .map(|t| format!("{} ({})", t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"), age(t)))
                        .unwrap_or_default();
                    println!(
                        "  {:<56} {:<8} {:>10}  {}",
                        object.object.key,
                        object.name.tier,
                        human_size(object.object.size),
                        when
                    );
                }
            }
            Err(e) => tracing::warn!("Could not list remote backups: {:#}", e),
        }
    }
    Ok(())
}
