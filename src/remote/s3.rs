// dbvault/src/remote/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{ObjectStore, RemoteObject};
use crate::config::S3Settings;

/// S3 or any S3-compatible service reachable through `BACKUP_S3_ENDPOINT`.
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
    endpoint: Option<String>,
}

impl S3ObjectStore {
    /// Credentials come from the standard AWS provider chain.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // Custom endpoints (MinIO, Spaces, Ceph) generally want path-style keys.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.endpoint.is_some())
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: settings.bucket.clone(),
            endpoint: settings.endpoint.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("s3://{} via {}", self.bucket, endpoint),
            None => format!("s3://{}", self.bucket),
        }
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {} to s3://{}/{}", path.display(), self.bucket, key))?;
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<bool> {
        let mut object = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(object) => object,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    return Ok(false);
                }
                return Err(anyhow::Error::new(service))
                    .with_context(|| format!("Failed to get object s3://{}/{}", self.bucket, key));
            }
        };

        let mut output = File::create(dest)
            .await
            .with_context(|| format!("Failed to create destination file: {}", dest.display()))?;
        let mut total = 0usize;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Failed while downloading s3://{}/{}", self.bucket, key))?
        {
            output
                .write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write to destination file: {}", dest.display()))?;
            total += chunk.len();
        }
        output.flush().await?;
        tracing::debug!("Downloaded {} bytes from s3://{}/{}", total, self.bucket, key);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, prefix))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }
}
