// dbvault/src/backup/retention.rs
use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::artifact::{Tier, scan_artifacts, sidecars};
use crate::errors::PipelineError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Removes artifacts of `database` in `tier` older than `days`, with sidecars.
///
/// Returns the number of artifacts removed.
pub fn sweep(backup_dir: &Path, database: &str, tier: Tier, days: u32) -> Result<usize> {
    sweep_at(backup_dir, database, tier, days, SystemTime::now())
}

pub fn sweep_at(backup_dir: &Path, database: &str, tier: Tier, days: u32, now: SystemTime) -> Result<usize> {
    let cutoff = now
        .checked_sub(DAY * days)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let candidates = scan_artifacts(backup_dir)
        .map_err(|e| PipelineError::Cleanup(format!("{:#}", e)))?;

    let mut removed = 0;
    for artifact in candidates
        .iter()
        .filter(|a| a.name.database == database && a.name.tier == tier)
        .filter(|a| a.modified < cutoff)
    {
        fs::remove_file(&artifact.path).map_err(|e| {
            PipelineError::Cleanup(format!("cannot remove {}: {}", artifact.path.display(), e))
        })?;
        for sidecar in sidecars(&artifact.path) {
            match fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PipelineError::Cleanup(format!(
                        "cannot remove {}: {}",
                        sidecar.display(),
                        e
                    ))
                    .into());
                }
            }
        }
        tracing::info!("Removed expired {} backup: {}", tier, artifact.path.display());
        removed += 1;
    }

    if removed == 0 {
        tracing::debug!("No expired {} backups of {} older than {} days", tier, database, days);
    }
    Ok(removed)
}
