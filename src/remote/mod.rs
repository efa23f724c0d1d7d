//! Off-site copies of artifacts in an S3-compatible bucket.
//!
//! Keys are `{prefix}/{tier}/{file}` plus the `.sha256` and `.meta` sidecars
//! under the same name.

pub mod s3;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact::{
    ArtifactName, BackupArtifact, CHECKSUM_SUFFIX, METADATA_SUFFIX, Tier, checksum, checksum_path,
    metadata_path,
};
use crate::config::S3Settings;
use crate::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Minimal object storage surface used by the pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn describe(&self) -> String;

    fn bucket(&self) -> &str;

    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Writes the object to `dest`. `Ok(false)` when the key does not exist.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<bool>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
}

/// Where a remote artifact lives: an explicit `s3://bucket/key` or a bare
/// artifact file name resolved against the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub bucket: Option<String>,
    pub key: String,
}

impl RemoteRef {
    pub fn parse(raw: &str, prefix: &str) -> Result<Self> {
        if raw.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(raw)?;
            return Ok(Self {
                bucket: Some(bucket),
                key,
            });
        }
        let name = ArtifactName::parse(raw).ok_or_else(|| {
            PipelineError::BackupFile(format!(
                "'{}' is neither an s3:// URI nor a backup file name",
                raw
            ))
        })?;
        Ok(Self {
            bucket: None,
            key: object_key(prefix, name.tier, raw),
        })
    }

    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let parsed = url::Url::parse(uri).map_err(|e| PipelineError::BackupFile(format!("invalid S3 URI {}: {}", uri, e)))?;
    if parsed.scheme() != "s3" {
        return Err(PipelineError::BackupFile(format!("S3 URI must start with s3://, got {}", uri)).into());
    }
    let bucket = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| PipelineError::BackupFile(format!("S3 URI missing bucket name: {}", uri)))?
        .to_string();
    let key = parsed.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(PipelineError::BackupFile(format!("S3 URI missing object key: {}", uri)).into());
    }
    Ok((bucket, key))
}

fn object_key(prefix: &str, tier: Tier, file_name: &str) -> String {
    if prefix.is_empty() {
        format!("{}/{}", tier, file_name)
    } else {
        format!("{}/{}/{}", prefix, tier, file_name)
    }
}

/// A remote artifact whose key parses as an artifact name.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    pub object: RemoteObject,
    pub name: ArtifactName,
}

/// A remote artifact copied into a scratch directory.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub key: String,
}

pub struct RemoteSync {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl RemoteSync {
    pub fn new(store: Arc<dyn ObjectStore>, settings: &S3Settings) -> Self {
        Self {
            store,
            prefix: settings.prefix.clone(),
        }
    }

    /// Production store for the configured bucket.
    pub async fn connect(settings: &S3Settings) -> Self {
        Self::new(Arc::new(s3::S3ObjectStore::connect(settings).await), settings)
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub fn key_for(&self, tier: Tier, file_name: &str) -> String {
        object_key(&self.prefix, tier, file_name)
    }

    pub fn parse_ref(&self, raw: &str) -> Result<RemoteRef> {
        RemoteRef::parse(raw, &self.prefix)
    }

    /// Uploads the artifact and its sidecars; returns the artifact key.
    pub async fn upload(&self, artifact: &BackupArtifact) -> Result<String> {
        let key = self.key_for(artifact.tier, &artifact.file_name());
        tracing::info!("Uploading {} to {}/{}", artifact.path.display(), self.describe(), key);

        self.put(&key, &artifact.path).await?;
        for (suffix, path) in [
            (CHECKSUM_SUFFIX, artifact.checksum_path()),
            (METADATA_SUFFIX, artifact.metadata_path()),
        ] {
            if !path.exists() {
                tracing::debug!("Skipping missing sidecar {}", path.display());
                continue;
            }
            self.put(&format!("{}{}", key, suffix), &path).await?;
        }
        Ok(key)
    }

    async fn put(&self, key: &str, path: &Path) -> Result<()> {
        self.store
            .put_file(key, path)
            .await
            .map_err(|e| PipelineError::Upload(format!("{:#}", e)).into())
    }

    /// Fetches a remote artifact and its sidecars into `scratch`.
    ///
    /// The remote digest is rewritten as a local sidecar naming the local
    /// file so validation recomputes and compares it.
    pub async fn download(&self, remote: &RemoteRef, scratch: &Path) -> Result<DownloadedArtifact> {
        self.download_inner(remote, scratch)
            .await
            .map_err(|e| match e.downcast::<PipelineError>() {
                Ok(typed) => typed.into(),
                Err(e) => PipelineError::BackupFile(format!("{:#}", e)).into(),
            })
    }

    async fn download_inner(&self, remote: &RemoteRef, scratch: &Path) -> Result<DownloadedArtifact> {
        match &remote.bucket {
            Some(bucket) if bucket != self.store.bucket() => {
                return Err(PipelineError::BackupFile(format!(
                    "bucket '{}' is not the configured bucket '{}'",
                    bucket,
                    self.store.bucket()
                ))
                .into());
            }
            _ => {}
        }

        let path = scratch.join(remote.file_name());
        tracing::info!("Downloading {}/{} to {}", self.describe(), remote.key, path.display());
        if !self.store.get_file(&remote.key, &path).await? {
            return Err(PipelineError::BackupFile(format!("remote backup not found: {}", remote.key)).into());
        }

        let remote_sum = scratch.join(format!("{}.remote{}", remote.file_name(), CHECKSUM_SUFFIX));
        let has_checksum = self
            .store
            .get_file(&format!("{}{}", remote.key, CHECKSUM_SUFFIX), &remote_sum)
            .await?;
        if has_checksum {
            let raw = tokio::fs::read_to_string(&remote_sum)
                .await
                .with_context(|| format!("Failed to read {}", remote_sum.display()))?;
            match checksum::parse_sidecar(&raw) {
                Some(digest) => checksum::write_sidecar_line(&path, &digest)?,
                None => tokio::fs::write(checksum_path(&path), raw).await?,
            }
            let _ = tokio::fs::remove_file(&remote_sum).await;
        } else {
            tracing::warn!("No remote checksum for {}", remote.key);
        }

        if !self
            .store
            .get_file(&format!("{}{}", remote.key, METADATA_SUFFIX), &metadata_path(&path))
            .await?
        {
            tracing::debug!("No remote metadata for {}", remote.key);
        }

        Ok(DownloadedArtifact {
            path,
            key: remote.key.clone(),
        })
    }

    /// Remote artifacts under the prefix, newest first.
    pub async fn list(&self) -> Result<Vec<RemoteArtifact>> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let objects = self
            .store
            .list(&prefix)
            .await
            .map_err(|e| PipelineError::BackupFile(format!("{:#}", e)))?;

        let mut found: Vec<RemoteArtifact> = objects
            .into_iter()
            .filter_map(|object| {
                let file = object.key.rsplit('/').next()?;
                let name = ArtifactName::parse(file)?;
                Some(RemoteArtifact { object, name })
            })
            .collect();
        found.sort_by(|a, b| {
            b.object
                .last_modified
                .cmp(&a.object.last_modified)
                .then_with(|| b.name.timestamp.cmp(&a.name.timestamp))
        });
        Ok(found)
    }

    /// Newest remote artifact, preferring those of `database`.
    pub async fn latest(&self, database: &str) -> Result<Option<RemoteRef>> {
        let all = self.list().await?;
        let pick = all
            .iter()
            .find(|a| a.name.database == database)
            .or_else(|| all.first());
        Ok(pick.map(|a| RemoteRef {
            bucket: None,
            key: a.object.key.clone(),
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::{Command, exit_code_for};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Bucket held in memory; `fail` makes every call error.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) objects: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
        pub(crate) fail: bool,
    }

    impl MemoryStore {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn insert(&self, key: &str, body: &[u8], at: DateTime<Utc>) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body.to_vec(), at));
        }

        pub(crate) fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        fn check(&self) -> Result<()> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        fn describe(&self) -> String {
            "memory://test".to_string()
        }

        fn bucket(&self) -> &str {
            "test"
        }

        async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
            self.check()?;
            let body = std::fs::read(path)?;
            self.insert(key, &body, Utc::now());
            Ok(())
        }

        async fn get_file(&self, key: &str, dest: &Path) -> Result<bool> {
            self.check()?;
            let body = self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone());
            match body {
                Some(body) => {
                    std::fs::write(dest, body)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
            self.check()?;
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, (body, at))| RemoteObject {
                    key: k.clone(),
                    size: body.len() as u64,
                    last_modified: Some(*at),
                })
                .collect())
        }
    }

    pub(crate) fn settings() -> S3Settings {
        S3Settings {
            bucket: "test".into(),
            prefix: "backups".into(),
            endpoint: None,
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn test_remote_ref_parsing() -> Result<()> {
        let uri = RemoteRef::parse("s3://test/backups/daily/acme_daily_20260101_020000.sql.gz", "backups")?;
        assert_eq!(uri.bucket.as_deref(), Some("test"));
        assert_eq!(uri.key, "backups/daily/acme_daily_20260101_020000.sql.gz");
        assert_eq!(uri.file_name(), "acme_daily_20260101_020000.sql.gz");

        let bare = RemoteRef::parse("acme_weekly_20260101_020000.sql.gz", "prod")?;
        assert_eq!(bare.bucket, None);
        assert_eq!(bare.key, "prod/weekly/acme_weekly_20260101_020000.sql.gz");

        assert!(RemoteRef::parse("s3://bucket-only", "x").is_err());
        let err = RemoteRef::parse("notes.txt", "x").unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_then_download_rewrites_checksum() -> Result<()> {
        let src = tempfile::tempdir()?;
        let path = src.path().join("acme_daily_20260101_020000.sql.gz");
        std::fs::write(&path, b"compressed")?;
        let digest = checksum::write_sidecar(&path)?;
        let artifact = BackupArtifact {
            path: path.clone(),
            database: "acme".into(),
            tier: Tier::Daily,
            schema_only: false,
            created_at: chrono::Local::now(),
            size_bytes: 10,
            duration_seconds: 0.1,
            checksum_sha256: digest.clone(),
        };

        let store = Arc::new(MemoryStore::default());
        let sync = RemoteSync::new(store.clone(), &settings());
        let key = sync.upload(&artifact).await?;
        assert_eq!(key, "backups/daily/acme_daily_20260101_020000.sql.gz");
        assert_eq!(
            store.keys(),
            vec![key.clone(), format!("{}.sha256", key)],
            "metadata is skipped when absent"
        );

        let scratch = tempfile::tempdir()?;
        let remote = sync.latest("acme").await?.expect("one remote artifact");
        let downloaded = sync.download(&remote, scratch.path()).await?;
        assert_eq!(std::fs::read(&downloaded.path)?, b"compressed");
        let local_sum = std::fs::read_to_string(checksum_path(&downloaded.path))?;
        assert_eq!(local_sum, format!("{}  acme_daily_20260101_020000.sql.gz\n", digest));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_remote_is_backup_file_error() -> Result<()> {
        let sync = RemoteSync::new(Arc::new(MemoryStore::default()), &settings());
        let scratch = tempfile::tempdir()?;
        let remote = RemoteRef::parse("acme_daily_20260101_020000.sql.gz", "backups")?;
        let err = sync.download(&remote, scratch.path()).await.unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 4);

        let gone = BackupArtifact {
            path: scratch.path().join("acme_daily_20260101_020000.sql.gz"),
            database: "acme".into(),
            tier: Tier::Daily,
            schema_only: false,
            created_at: chrono::Local::now(),
            size_bytes: 0,
            duration_seconds: 0.0,
            checksum_sha256: String::new(),
        };
        let err = sync.upload(&gone).await.unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Backup), 6);

        let failing = RemoteSync::new(Arc::new(MemoryStore::failing()), &settings());
        let err = failing.list().await.unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_prefers_configured_database() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        store.insert("backups/daily/acme_daily_20260101_020000.sql.gz", b"a", now - chrono::Duration::hours(2));
        store.insert("backups/daily/globex_daily_20260102_020000.sql.gz", b"g", now);
        store.insert("backups/daily/README", b"x", now);
        let sync = RemoteSync::new(store, &settings());

        assert_eq!(sync.list().await?.len(), 2);
        let latest = sync.latest("acme").await?.unwrap();
        assert_eq!(latest.file_name(), "acme_daily_20260101_020000.sql.gz");
        let fallback = sync.latest("initech").await?.unwrap();
        assert_eq!(fallback.file_name(), "globex_daily_20260102_020000.sql.gz");
        Ok(())
    }
}
