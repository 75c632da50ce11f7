//! Object store adapter for artifact persistence.
//!
//! Puts bytes under a key and mints time-limited read URLs. The adapter
//! does not retry; whether a failed upload is fatal to the job is the
//! worker's decision.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("object store error: {0}")]
pub struct StorageError(pub String);

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create the artifact bucket if it does not exist. Called at startup.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError>;

    /// Time-limited read URL for one object.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn health_check(&self) -> bool;
}

/// S3-compatible artifact store (MinIO locally, S3 in production).
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        region: &str,
        bucket: impl Into<String>,
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        match self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => {
                info!(bucket = %self.bucket, "created artifact bucket");
                Ok(())
            }
            Err(err) => {
                let service = err.into_service_error();
                if service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(StorageError(format!(
                        "failed to create bucket {}: {service}",
                        self.bucket
                    )))
                }
            }
        }
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let length = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError(format!("failed to upload {key}: {e}")))?;

        info!(key, bytes = length, "uploaded artifact");
        Ok(())
    }

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError(format!("failed to serialize {key}: {e}")))?;
        self.put_bytes(key, Bytes::from(body), "application/json")
            .await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError(format!("invalid presign ttl: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StorageError(format!("failed to presign {key}: {e}")))?;

        Ok(presigned.uri().to_string())
    }

    async fn health_check(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}

/// Object key for the i-th artifact of a job.
pub fn artifact_key(job_id: &str, index: usize) -> String {
    format!("jobs/{job_id}/image_{index}.png")
}

/// Object key for a job's metadata sidecar.
pub fn metadata_key(job_id: &str) -> String {
    format!("jobs/{job_id}/metadata.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_keys_follow_the_layout() {
        assert_eq!(
            artifact_key("j_abcdefghijkl", 0),
            "jobs/j_abcdefghijkl/image_0.png"
        );
        assert_eq!(
            metadata_key("j_abcdefghijkl"),
            "jobs/j_abcdefghijkl/metadata.json"
        );
    }
}
