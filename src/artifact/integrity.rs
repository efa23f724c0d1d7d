// dbvault/src/artifact/integrity.rs
//
// Read-only checks on an artifact file: size, checksum, gzip stream, dump banner.
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use super::checksum::{self, ChecksumStatus};
use super::checksum_path;
use crate::errors::PipelineError;

/// Decompressed bytes read by the gzip smoke test.
pub const SMOKE_TEST_BYTES: u64 = 64 * 1024;
/// Lines searched for the producer banner.
pub const HEADER_SCAN_LINES: usize = 50;
pub const DUMP_BANNER: &str = "PostgreSQL database dump";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub size_bytes: u64,
    pub checksum: ChecksumStatus,
}

/// Runs every check and fails on the first hard problem.
///
/// A missing checksum sidecar is reported, not fatal. A mismatch is
/// [`PipelineError::ChecksumMismatch`]; anything else wrong with the bytes is
/// [`PipelineError::BackupCorrupt`].
pub fn check_artifact(path: &Path) -> Result<IntegrityReport> {
    let size_bytes = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat backup file: {}", path.display()))?
        .len();
    if size_bytes == 0 {
        return Err(PipelineError::BackupCorrupt(format!("{} is empty", path.display())).into());
    }

    let checksum = checksum::verify(path, &checksum_path(path))?;
    if let ChecksumStatus::Fail { expected, actual } = &checksum {
        return Err(PipelineError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
        }
        .into());
    }

    gzip_smoke_test(path)?;
    check_dump_header(path)?;

    Ok(IntegrityReport { size_bytes, checksum })
}

/// Decompresses a bounded prefix of the artifact.
pub fn gzip_smoke_test(path: &Path) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("Failed to open backup file: {}", path.display()))?;
    let mut prefix = GzDecoder::new(file).take(SMOKE_TEST_BYTES);
    let mut sink = Vec::new();
    match prefix.read_to_end(&mut sink) {
        Ok(0) => Err(PipelineError::BackupCorrupt(format!(
            "{} decompresses to nothing",
            path.display()
        ))
        .into()),
        Ok(n) => Ok(n as u64),
        Err(e) => Err(PipelineError::BackupCorrupt(format!(
            "{} is not a readable gzip stream: {}",
            path.display(),
            e
        ))
        .into()),
    }
}

/// Looks for the dump producer's banner in the first lines.
pub fn check_dump_header(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open backup file: {}", path.display()))?;
    let mut reader = BufReader::new(GzDecoder::new(file));
    let mut line = Vec::new();
    for _ in 0..HEADER_SCAN_LINES {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).map_err(|e| {
            PipelineError::BackupCorrupt(format!("{} could not be read: {}", path.display(), e))
        })?;
        if n == 0 {
            break;
        }
        if String::from_utf8_lossy(&line).contains(DUMP_BANNER) {
            return Ok(());
        }
    }
    Err(PipelineError::BackupCorrupt(format!(
        "{} does not look like a PostgreSQL dump (no '{}' banner in the first {} lines)",
        path.display(),
        DUMP_BANNER,
        HEADER_SCAN_LINES
    ))
    .into())
}
