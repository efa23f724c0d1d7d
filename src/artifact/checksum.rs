// dbvault/src/artifact/checksum.rs
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::{checksum_path, file_name_of};

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Pass,
    Fail { expected: String, actual: String },
    /// No sidecar next to the artifact; older backups predate checksums.
    NoSidecar,
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn compute(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for checksumming", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {} for checksumming", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes `<hex>  <file name>` next to the artifact and returns the digest.
pub fn write_sidecar(artifact: &Path) -> Result<String> {
    let digest = compute(artifact)?;
    write_sidecar_line(artifact, &digest)?;
    Ok(digest)
}

pub fn write_sidecar_line(artifact: &Path, digest: &str) -> Result<()> {
    let sidecar = checksum_path(artifact);
    std::fs::write(&sidecar, format!("{}  {}\n", digest, file_name_of(artifact)))
        .with_context(|| format!("Failed to write checksum file: {}", sidecar.display()))
}

/// Extracts the digest token from a `sha256sum`-style line.
pub fn parse_sidecar(contents: &str) -> Option<String> {
    let token = contents.split_whitespace().next()?;
    (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit())).then(|| token.to_ascii_lowercase())
}

pub fn verify(artifact: &Path, sidecar: &Path) -> Result<ChecksumStatus> {
    if !sidecar.exists() {
        return Ok(ChecksumStatus::NoSidecar);
    }
    let contents = std::fs::read_to_string(sidecar)
        .with_context(|| format!("Failed to read checksum file: {}", sidecar.display()))?;
    let actual = compute(artifact)?;
    Ok(match parse_sidecar(&contents) {
        Some(expected) if expected == actual => ChecksumStatus::Pass,
        Some(expected) => ChecksumStatus::Fail { expected, actual },
        None => ChecksumStatus::Fail {
            expected: format!("<malformed: {}>", contents.trim()),
            actual,
        },
    })
}
