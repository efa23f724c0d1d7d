// dbvault/src/restore/validate.rs
use anyhow::Result;
use std::path::Path;

use crate::artifact::checksum::ChecksumStatus;
use crate::artifact::integrity::{self, IntegrityReport};

/// Gate run before anything touches a database. Fails with `BackupCorrupt`
/// or `ChecksumMismatch`; a missing checksum only warns.
pub fn validate_artifact(path: &Path) -> Result<IntegrityReport> {
    let report = integrity::check_artifact(path)?;
    if report.checksum == ChecksumStatus::NoSidecar {
        tracing::warn!(
            "No checksum file for {}; integrity relies on the gzip and header checks",
            path.display()
        );
    } else {
        tracing::info!("Checksum verified for {}", path.display());
    }
    tracing::info!("Backup file is valid ({} bytes)", report.size_bytes);
    Ok(report)
}
