//! Backup artifact naming, metadata and discovery.
//!
//! An artifact is `{database}_{tier}_{YYYYMMDD_HHMMSS}[_schema].sql.gz`
//! with two sidecars next to it: `<artifact>.sha256` and `<artifact>.meta`.

pub mod checksum;
pub mod integrity;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

pub const ARTIFACT_SUFFIX: &str = ".sql.gz";
pub const CHECKSUM_SUFFIX: &str = ".sha256";
pub const METADATA_SUFFIX: &str = ".meta";
const SCHEMA_MARKER: &str = "_schema";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Retention class of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured form of an artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub database: String,
    pub tier: Tier,
    pub timestamp: NaiveDateTime,
    pub schema_only: bool,
}

impl ArtifactName {
    pub fn new(database: &str, tier: Tier, timestamp: NaiveDateTime, schema_only: bool) -> Self {
        Self {
            database: database.to_string(),
            tier,
            timestamp,
            schema_only,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}{}{}",
            self.database,
            self.tier,
            self.timestamp.format(TIMESTAMP_FORMAT),
            if self.schema_only { SCHEMA_MARKER } else { "" },
            ARTIFACT_SUFFIX
        )
    }

    pub fn path(&self, backup_dir: &Path) -> PathBuf {
        backup_dir.join(self.file_name())
    }

    /// Parses a file name produced by [`ArtifactName::file_name`].
    ///
    /// Works from the right because database names may contain underscores.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(ARTIFACT_SUFFIX)?;
        let (stem, schema_only) = match stem.strip_suffix(SCHEMA_MARKER) {
            Some(rest) => (rest, true),
            None => (stem, false),
        };

        // "<database>_<tier>_<YYYYMMDD>_<HHMMSS>"
        let mut parts = stem.rsplitn(4, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let tier = Tier::parse(parts.next()?)?;
        let database = parts.next()?;
        if database.is_empty() || date.len() != 8 || time.len() != 6 {
            return None;
        }
        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), TIMESTAMP_FORMAT).ok()?;

        Some(Self::new(database, tier, timestamp, schema_only))
    }
}

pub fn checksum_path(artifact: &Path) -> PathBuf {
    append_suffix(artifact, CHECKSUM_SUFFIX)
}

pub fn metadata_path(artifact: &Path) -> PathBuf {
    append_suffix(artifact, METADATA_SUFFIX)
}

pub fn sidecars(artifact: &Path) -> [PathBuf; 2] {
    [checksum_path(artifact), metadata_path(artifact)]
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A completed backup on local disk.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub database: String,
    pub tier: Tier,
    pub schema_only: bool,
    pub created_at: DateTime<Local>,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub checksum_sha256: String,
}

impl BackupArtifact {
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }

    pub fn checksum_path(&self) -> PathBuf {
        checksum_path(&self.path)
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_path(&self.path)
    }
}

/// Contents of the `.meta` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub backup_file: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub tier: Tier,
    pub schema_only: bool,
    pub created_at: String,
    pub created_at_unix: i64,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub tool_version: String,
    pub script_version: String,
    pub hostname: String,
}

impl ArtifactMetadata {
    pub fn write(&self, artifact: &Path) -> Result<PathBuf> {
        let path = metadata_path(artifact);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize backup metadata")?;
        std::fs::write(&path, json + "\n")
            .with_context(|| format!("Failed to write metadata file: {}", path.display()))?;
        Ok(path)
    }

    #[cfg(test)]
    pub fn read(artifact: &Path) -> Result<Self> {
        let path = metadata_path(artifact);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse metadata file: {}", path.display()))
    }
}

/// An artifact found while scanning a backup directory.
#[derive(Debug, Clone)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub name: ArtifactName,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl LocalArtifact {
    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// Lists conforming artifacts directly inside `backup_dir`, newest first.
///
/// A missing directory yields an empty list.
pub fn scan_artifacts(backup_dir: &Path) -> Result<Vec<LocalArtifact>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(backup_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to scan backup directory: {}", backup_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().and_then(ArtifactName::parse) else {
            continue;
        };
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        found.push(LocalArtifact {
            path: entry.path().to_path_buf(),
            name,
            size_bytes: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.timestamp.cmp(&a.name.timestamp)));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(2, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let name = ArtifactName::new("acme", Tier::Daily, ts(), false);
        assert_eq!(name.file_name(), "acme_daily_20260314_023005.sql.gz");

        let schema = ArtifactName::new("acme", Tier::Monthly, ts(), true);
        assert_eq!(schema.file_name(), "acme_monthly_20260314_023005_schema.sql.gz");
        assert_eq!(
            schema.path(Path::new("/var/backups")),
            PathBuf::from("/var/backups/acme_monthly_20260314_023005_schema.sql.gz")
        );
    }

    #[test]
    fn test_parse_handles_underscored_database_names() {
        let name = ArtifactName::new("acme_prod_eu", Tier::Weekly, ts(), true);
        assert_eq!(ArtifactName::parse(&name.file_name()), Some(name));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        for bad in [
            "acme_daily_20260314_023005.sql",
            "acme_hourly_20260314_023005.sql.gz",
            "_daily_20260314_023005.sql.gz",
            "acme_daily_2026031_023005.sql.gz",
            "acme_daily_20261399_023005.sql.gz",
            "notes.txt",
        ] {
            assert_eq!(ArtifactName::parse(bad), None, "{} should not parse", bad);
        }
    }

    #[test]
    fn test_sidecar_paths() {
        let artifact = Path::new("/b/acme_daily_20260314_023005.sql.gz");
        assert_eq!(
            checksum_path(artifact),
            PathBuf::from("/b/acme_daily_20260314_023005.sql.gz.sha256")
        );
        assert_eq!(
            metadata_path(artifact),
            PathBuf::from("/b/acme_daily_20260314_023005.sql.gz.meta")
        );
    }

    #[test]
    fn test_scan_skips_sidecars_and_strangers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = ArtifactName::new("acme", Tier::Daily, ts(), false).path(dir.path());
        std::fs::write(&artifact, b"x")?;
        std::fs::write(checksum_path(&artifact), b"y")?;
        std::fs::write(dir.path().join("README"), b"z")?;

        let found = scan_artifacts(dir.path())?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.database, "acme");
        assert!(scan_artifacts(&dir.path().join("missing"))?.is_empty());
        Ok(())
    }
}
