// pgdump-s3-backup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

/// Files at or above this size go through multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
pub const PART_SIZE: u64 = 16 * 1024 * 1024;
/// S3 rejects part numbers above this.
pub const MAX_PARTS: u64 = 10_000;
const MIB: u64 = 1024 * 1024;

/// Remote object storage that accepts whole files.
///
/// Implementations must leave either the complete object or nothing under
/// `key`; a partially written object is never acceptable.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<()>;
}

/// Checks the local artifact and hands it to `store`.
pub async fn upload_artifact<S: ObjectStore + ?Sized>(
    store: &S,
    file_path: &Path,
    bucket: &str,
    key: &str,
    storage_class: Option<&str>,
) -> Result<()> {
    let failed = |message: String| BackupError::UploadFailed {
        path: file_path.to_path_buf(),
        bucket: bucket.to_string(),
        key: key.to_string(),
        message,
    };

    let metadata = tokio::fs::metadata(file_path)
        .await
        .map_err(|e| failed(format!("local file is not readable: {}", e)))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(failed("local file is missing or empty".to_string()));
    }

    info!(
        "⬆️  Uploading {} ({} bytes) to s3://{}/{}",
        file_path.display(),
        metadata.len(),
        bucket,
        key
    );
    store.upload_file(file_path, bucket, key, storage_class).await?;
    info!("✅ Backup uploaded to S3 as '{}'", key);
    Ok(())
}

/// Part size for a `size`-byte upload: [`PART_SIZE`], grown in whole MiB
/// when the file would otherwise need more than [`MAX_PARTS`] parts.
pub fn part_size_for(size: u64) -> u64 {
    let needed = size.div_ceil(MAX_PARTS).div_ceil(MIB) * MIB;
    PART_SIZE.max(needed)
}

/// Splits `size` bytes into `(part_number, offset, length)` triples.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<(i32, u64, u64)> {
    (0..size)
        .step_by(part_size as usize)
        .enumerate()
        .map(|(index, offset)| (index as i32 + 1, offset, part_size.min(size - offset)))
        .collect()
}

/// [`ObjectStore`] backed by Amazon S3 or an S3-compatible service.
pub struct S3Store {
    client: s3::Client,
}

impl S3Store {
    /// Builds a client from the storage config, falling back to the default
    /// AWS region and credential chain for anything not set explicitly.
    pub async fn connect(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &storage.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        if let Some(credentials) = &storage.credentials {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        Self {
            client: s3::Client::new(&sdk_config),
        }
    }

    async fn put_single(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> std::result::Result<(), String> {
        let body = ByteStream::from_path(file_path)
            .await
            .map_err(|e| format!("failed to open {}: {}", file_path.display(), e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_storage_class(storage_class.map(StorageClass::from))
            .body(body)
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        file_path: &Path,
        size: u64,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> std::result::Result<(), String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| "service did not return an upload id".to_string())?
            .to_string();

        match self.send_parts(file_path, size, bucket, key, &upload_id).await {
            Ok(()) => Ok(()),
            Err(message) => {
                if let Err(e) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort multipart upload {} for s3://{}/{}: {}",
                        upload_id,
                        bucket,
                        key,
                        DisplayErrorContext(&e)
                    );
                }
                Err(message)
            }
        }
    }

    async fn send_parts(
        &self,
        file_path: &Path,
        size: u64,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> std::result::Result<(), String> {
        let part_size = part_size_for(size);
        debug!("Uploading {} bytes in parts of {} bytes", size, part_size);
        let mut completed = Vec::new();
        for (part_number, offset, length) in plan_parts(size, part_size) {
            let body = ByteStream::read_from()
                .path(file_path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| format!("failed to read part {} of {}: {}", part_number, file_path.display(), e))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| format!("part {}: {}", part_number, DisplayErrorContext(&e)))?;
            debug!("Uploaded part {} ({} bytes)", part_number, length);

            completed.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_file(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<()> {
        let failed = |message: String| BackupError::UploadFailed {
            path: PathBuf::from(file_path),
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let size = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| failed(e.to_string()))?
            .len();

        let outcome = if size >= MULTIPART_THRESHOLD {
            debug!("Using multipart upload for {} bytes", size);
            self.put_multipart(file_path, size, bucket, key, storage_class)
                .await
        } else {
            self.put_single(file_path, bucket, key, storage_class).await
        };
        outcome.map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn upload_file(
            &self,
            _file_path: &Path,
            _bucket: &str,
            key: &str,
            _storage_class: Option<&str>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_plan_parts() {
        assert!(plan_parts(0, 10).is_empty());
        assert_eq!(plan_parts(10, 10), vec![(1, 0, 10)]);
        assert_eq!(plan_parts(25, 10), vec![(1, 0, 10), (2, 10, 10), (3, 20, 5)]);

        let parts = plan_parts(MULTIPART_THRESHOLD + 1, PART_SIZE);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts.iter().map(|p| p.2).sum::<u64>(), MULTIPART_THRESHOLD + 1);
    }

    #[test]
    fn test_part_size_stays_within_part_limit() {
        assert_eq!(part_size_for(MULTIPART_THRESHOLD), PART_SIZE);
        assert_eq!(part_size_for(PART_SIZE * MAX_PARTS), PART_SIZE);

        for size in [PART_SIZE * MAX_PARTS + 1, 200 * 1024 * MIB, 5 * 1024 * 1024 * MIB] {
            let part_size = part_size_for(size);
            assert!(part_size > PART_SIZE);
            assert_eq!(part_size % MIB, 0);
            let parts = plan_parts(size, part_size);
            assert!(parts.len() as u64 <= MAX_PARTS, "{} parts for {} bytes", parts.len(), size);
            assert_eq!(parts.iter().map(|p| p.2).sum::<u64>(), size);
            assert_eq!(parts.last().map(|p| p.0), Some(parts.len() as i32));
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected_before_upload() {
        let store = RecordingStore::default();
        let dir = tempfile::tempdir().unwrap();
        let result = upload_artifact(
            &store,
            &dir.path().join("missing.sql.gz"),
            "bucket",
            "missing.sql.gz",
            None,
        )
        .await;

        assert!(matches!(result, Err(BackupError::UploadFailed { .. })));
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected_before_upload() {
        let store = RecordingStore::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sql.gz");
        std::fs::write(&path, b"").unwrap();

        let result = upload_artifact(&store, &path, "bucket", "empty.sql.gz", None).await;
        match result {
            Err(BackupError::UploadFailed { message, .. }) => assert!(message.contains("empty")),
            other => panic!("expected UploadFailed, got {:?}", other),
        }
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_file_is_handed_to_store() {
        let store = RecordingStore::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.sql.gz");
        std::fs::write(&path, b"not really gzip").unwrap();

        upload_artifact(&store, &path, "bucket", "pg/orders.sql.gz", Some("STANDARD_IA"))
            .await
            .unwrap();
        assert_eq!(*store.calls.lock().unwrap(), vec!["pg/orders.sql.gz".to_string()]);
    }
}
