// dbvault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::utils::find_executable;

/// Turns a plain dump stream into a single gzip stream written to `output`.
pub trait Compressor: Send + Sync {
    fn describe(&self) -> String;

    /// Returns the number of uncompressed bytes consumed.
    fn compress(&self, input: &mut dyn Read, output: File) -> Result<u64>;
}

/// In-process gzip.
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Compressor for GzipCompressor {
    fn describe(&self) -> String {
        format!("gzip -{}", self.level)
    }

    fn compress(&self, input: &mut dyn Read, output: File) -> Result<u64> {
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::new(self.level));
        let consumed = io::copy(input, &mut encoder).context("Failed to compress dump stream")?;
        let writer = encoder.finish().context("Failed to finish Gzip encoding")?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush compressed output: {}", e.error()))?;
        file.sync_all().context("Failed to sync compressed output")?;
        Ok(consumed)
    }
}

/// `pigz` with a bounded number of worker threads. Output is still one
/// ordered gzip stream.
pub struct PigzCompressor {
    executable: PathBuf,
    level: u32,
    workers: usize,
}

impl PigzCompressor {
    pub fn new(executable: PathBuf, level: u32, workers: usize) -> Self {
        Self {
            executable,
            level,
            workers,
        }
    }
}

impl Compressor for PigzCompressor {
    fn describe(&self) -> String {
        format!("pigz -{} -p {}", self.level, self.workers)
    }

    fn compress(&self, input: &mut dyn Read, output: File) -> Result<u64> {
        let mut child = Command::new(&self.executable)
            .arg(format!("-{}", self.level))
            .arg("-p")
            .arg(self.workers.to_string())
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to execute pigz")?;

        let consumed = {
            let mut stdin = child.stdin.take().context("pigz stdin was not captured")?;
            let copied = io::copy(input, &mut stdin);
            drop(stdin);
            match copied {
                Ok(n) => n,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e).context("Failed to feed dump stream to pigz");
                }
            }
        };

        let out = child.wait_with_output().context("Failed to wait for pigz")?;
        if !out.status.success() {
            return Err(anyhow::anyhow!(
                "pigz failed with status: {}\nStderr: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(consumed)
    }
}

/// Uses pigz when more than one worker is requested and it is installed.
pub fn select_compressor(level: u32, workers: usize) -> Box<dyn Compressor> {
    if workers > 1 {
        match find_executable("pigz") {
            Ok(path) => return Box::new(PigzCompressor::new(path, level, workers)),
            Err(_) => tracing::debug!("pigz not found, falling back to single-threaded gzip"),
        }
    }
    Box::new(GzipCompressor::new(level))
}

/// Buffered reader over the decompressed contents of an artifact.
pub fn open_decompressed(path: &Path) -> Result<BufReader<GzDecoder<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open backup file: {}", path.display()))?;
    Ok(BufReader::with_capacity(128 * 1024, GzDecoder::new(file)))
}
