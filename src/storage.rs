//! Making a job's file available on local disk.
//!
//! A job's file is either a local path (written by the ingestion server) or an
//! object in the configured S3 bucket. The resolver fetches remote objects into
//! a scratch directory and remembers which copies it created so the pipeline
//! can delete exactly those.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, RetryConfig};

use crate::error::{CourierError, Result};
use crate::job::FileRef;

/// A file that is readable on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: PathBuf,
    /// True when the resolver downloaded this copy and owns it
    pub fetched: bool,
}

/// Resolves [`FileRef`]s to local files and uploads intake files to the bucket.
#[derive(Clone)]
pub struct StorageResolver {
    remote: Option<(Arc<dyn ObjectStore>, String)>,
    temp_dir: PathBuf,
}

impl StorageResolver {
    /// A resolver that only handles local references.
    pub fn local(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote: None,
            temp_dir: temp_dir.into(),
        }
    }

    /// Enable remote references for objects in `bucket`.
    pub fn with_remote(mut self, store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        self.remote = Some((store, bucket.into()));
        self
    }

    pub fn bucket(&self) -> Option<&str> {
        self.remote.as_ref().map(|(_, bucket)| bucket.as_str())
    }

    fn store_for(&self, reference: &str, bucket: &str) -> Result<&Arc<dyn ObjectStore>> {
        match &self.remote {
            Some((store, configured)) if configured == bucket => Ok(store),
            Some((_, configured)) => Err(CourierError::Resolution {
                reference: reference.to_string(),
                reason: format!(
                    "bucket '{}' does not match configured bucket '{}'",
                    bucket, configured
                ),
            }),
            None => Err(CourierError::Resolution {
                reference: reference.to_string(),
                reason: "no object storage configured".to_string(),
            }),
        }
    }

    /// Guarantee the referenced file exists locally.
    #[tracing::instrument(skip(self), fields(file_ref = %file_ref))]
    pub async fn resolve(&self, file_ref: &FileRef) -> Result<ResolvedFile> {
        match file_ref {
            FileRef::Local(path) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(CourierError::Resolution {
                        reference: file_ref.to_string(),
                        reason: "local file does not exist".to_string(),
                    });
                }
                Ok(ResolvedFile {
                    path: path.clone(),
                    fetched: false,
                })
            }
            FileRef::Remote { bucket, key } => {
                let reference = file_ref.to_string();
                let store = self.store_for(&reference, bucket)?;
                let resolution = |reason: String| CourierError::Resolution {
                    reference: reference.clone(),
                    reason,
                };

                let bytes = store
                    .get(&ObjectPath::from(key.as_str()))
                    .await
                    .map_err(|e| resolution(e.to_string()))?
                    .bytes()
                    .await
                    .map_err(|e| resolution(e.to_string()))?;

                tokio::fs::create_dir_all(&self.temp_dir)
                    .await
                    .map_err(|e| resolution(e.to_string()))?;
                let path = self.temp_dir.join(temp_file_name(key));
                tokio::fs::write(&path, &bytes)
                    .await
                    .map_err(|e| resolution(e.to_string()))?;

                tracing::debug!(path = %path.display(), bytes = bytes.len(), "Fetched remote file");
                Ok(ResolvedFile {
                    path,
                    fetched: true,
                })
            }
        }
    }

    /// Upload a local file under `key` and return its remote reference.
    #[tracing::instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn upload(&self, local_path: &Path, key: &str) -> Result<FileRef> {
        let Some((store, bucket)) = &self.remote else {
            return Err(CourierError::Validation(
                "remote storage mode requires a configured bucket".to_string(),
            ));
        };
        let bytes = tokio::fs::read(local_path).await?;
        store
            .put(&ObjectPath::from(key), PutPayload::from(bytes))
            .await?;
        Ok(FileRef::remote(bucket.clone(), key))
    }

    /// Delete the resolved file if the resolver created it. Used when an
    /// attempt fails and the source must survive for a retry.
    pub async fn discard_fetched(&self, file: &ResolvedFile) {
        if file.fetched {
            remove_quietly(&file.path).await;
        }
    }
}

/// Best-effort delete. Failures are logged, never returned.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Deleted local file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to delete local file"),
    }
}

fn temp_file_name(key: &str) -> String {
    let basename = key.rsplit('/').next().unwrap_or(key);
    format!(
        "{}_{}_{}",
        Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple(),
        basename
    )
}

/// Authenticated S3 store for `bucket`.
///
/// Credentials and region come from the environment (`AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`).
pub fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!(bucket, "Creating S3 client");

    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(
            ClientOptions::new()
                .with_connect_timeout(Duration::from_secs(5))
                .with_timeout(Duration::from_secs(60)),
        )
        .with_retry(RetryConfig {
            max_retries: 3,
            ..Default::default()
        })
        .build()?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn resolver_with_object(dir: &Path, key: &str, body: &[u8]) -> StorageResolver {
        let store = Arc::new(InMemory::new());
        store
            .put(&ObjectPath::from(key), PutPayload::from(body.to_vec()))
            .await
            .unwrap();
        StorageResolver::local(dir).with_remote(store, "cv-bucket")
    }

    #[tokio::test]
    async fn test_local_ref_is_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let resolver = StorageResolver::local(dir.path());
        let resolved = resolver.resolve(&FileRef::local(&path)).await.unwrap();
        assert_eq!(resolved.path, path);
        assert!(!resolved.fetched);

        // Discarding a non-fetched file leaves the source in place
        resolver.discard_fetched(&resolved).await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_a_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = StorageResolver::local(dir.path());
        let err = resolver
            .resolve(&FileRef::local(dir.path().join("gone.pdf")))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Resolution { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_remote_ref_is_fetched_to_a_unique_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_object(dir.path(), "batch_1/ada.pdf", b"ada").await;

        let reference = FileRef::remote("cv-bucket", "batch_1/ada.pdf");
        let first = resolver.resolve(&reference).await.unwrap();
        let second = resolver.resolve(&reference).await.unwrap();

        assert!(first.fetched);
        assert_ne!(first.path, second.path);
        assert!(first.path.starts_with(dir.path()));
        assert!(first.path.to_string_lossy().ends_with("_ada.pdf"));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"ada");

        resolver.discard_fetched(&first).await;
        assert!(!first.path.exists());
    }

    #[tokio::test]
    async fn test_remote_failures_are_resolution_errors() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_object(dir.path(), "batch_1/ada.pdf", b"ada").await;

        let missing = resolver
            .resolve(&FileRef::remote("cv-bucket", "batch_1/nobody.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(missing, CourierError::Resolution { .. }));

        let wrong_bucket = resolver
            .resolve(&FileRef::remote("other-bucket", "batch_1/ada.pdf"))
            .await
            .unwrap_err();
        assert!(wrong_bucket.to_string().contains("does not match"));

        let no_store = StorageResolver::local(dir.path())
            .resolve(&FileRef::remote("cv-bucket", "batch_1/ada.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(no_store, CourierError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_upload_returns_remote_reference() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("grace.pdf");
        std::fs::write(&source, b"grace").unwrap();

        let store = Arc::new(InMemory::new());
        let resolver = StorageResolver::local(dir.path()).with_remote(store.clone(), "cv-bucket");
        let reference = resolver.upload(&source, "batch_9/grace.pdf").await.unwrap();
        assert_eq!(reference, FileRef::remote("cv-bucket", "batch_9/grace.pdf"));

        let stored = store
            .get(&ObjectPath::from("batch_9/grace.pdf"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"grace");
    }

    #[tokio::test]
    async fn test_remove_quietly_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        remove_quietly(&dir.path().join("never-existed.pdf")).await;
    }
}
