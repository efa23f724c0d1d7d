// dbvault/src/backup/metrics.rs
//
// Prometheus textfile-collector output for the last successful backup.
use anyhow::{Context, Result};
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::artifact::BackupArtifact;

const LABELS: [&str; 2] = ["database", "type"];

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), &LABELS)
        .with_context(|| format!("Failed to define metric {}", name))?;
    registry
        .register(Box::new(gauge.clone()))
        .with_context(|| format!("Failed to register metric {}", name))?;
    Ok(gauge)
}

/// Renders the gauges for one artifact in the text exposition format.
pub fn render(artifact: &BackupArtifact) -> Result<String> {
    let registry = Registry::new();
    let labels = [artifact.database.as_str(), artifact.tier.as_str()];

    gauge(
        &registry,
        "backup_last_success_timestamp",
        "Unix time of the last successful backup",
    )?
    .with_label_values(&labels)
    .set(artifact.created_at.timestamp() as f64);
    gauge(&registry, "backup_size_bytes", "Compressed size of the last backup")?
        .with_label_values(&labels)
        .set(artifact.size_bytes as f64);
    gauge(
        &registry,
        "backup_duration_seconds",
        "Wall time of the last backup",
    )?
    .with_label_values(&labels)
    .set(artifact.duration_seconds);

    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("Failed to encode backup metrics")
}

/// Atomically replaces `dbvault_{database}_{tier}.prom` in `dir`.
pub fn write_textfile(dir: &Path, artifact: &BackupArtifact) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create metrics directory: {}", dir.display()))?;
    let target = dir.join(format!("dbvault_{}_{}.prom", artifact.database, artifact.tier));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary metrics file in {}", dir.display()))?;
    tmp.write_all(render(artifact)?.as_bytes())
        .context("Failed to write metrics")?;
    tmp.persist(&target)
        .with_context(|| format!("Failed to move metrics into place: {}", target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Tier;
    use chrono::Local;

    #[test]
    fn test_textfile_contains_labelled_gauges() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = BackupArtifact {
            path: dir.path().join("acme_weekly_20260101_020000.sql.gz"),
            database: "acme".into(),
            tier: Tier::Weekly,
            schema_only: false,
            created_at: Local::now(),
            size_bytes: 4096,
            duration_seconds: 2.5,
            checksum_sha256: "0".repeat(64),
        };

        let path = write_textfile(&dir.path().join("metrics"), &artifact)?;
        assert!(path.ends_with("dbvault_acme_weekly.prom"));
        let text = std::fs::read_to_string(path)?;
        assert!(text.contains(r#"backup_size_bytes{database="acme",type="weekly"} 4096"#));
        assert!(text.contains(r#"backup_duration_seconds{database="acme",type="weekly"} 2.5"#));
        assert!(text.contains("# TYPE backup_last_success_timestamp gauge"));
        Ok(())
    }
}
