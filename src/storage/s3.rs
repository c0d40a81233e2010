//! AWS S3 implementation of the ArtifactStore trait.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;
use tracing::{debug, error, info};

use super::ArtifactStore;
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Stores backup artifacts in an S3 bucket
pub struct S3ArtifactStore {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
    /// Prefix for artifact objects
    prefix: String,
}

impl S3ArtifactStore {
    /// Create a new S3ArtifactStore with the given configuration
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        // Configure AWS SDK with default credential provider chain
        let aws_config = aws_config::from_env()
            .region(aws_types::region::Region::new(config.aws_region.clone()))
            .load()
            .await;

        // Create S3 client
        let client = S3Client::new(&aws_config);

        // Verify that the bucket exists and is accessible
        match client
            .head_bucket()
            .bucket(&config.s3_bucket_name)
            .send()
            .await
        {
            Ok(_) => {
                info!("Successfully connected to S3 bucket: {}", &config.s3_bucket_name);
            }
            Err(err) => {
                error!("Failed to access S3 bucket: {}: {}", &config.s3_bucket_name, err);
                return Err(Error::Storage(format!(
                    "failed to access S3 bucket {}: {}",
                    &config.s3_bucket_name, err
                )));
            }
        }

        Ok(Self {
            client,
            bucket: config.s3_bucket_name.clone(),
            prefix: "artifacts/".to_string(),
        })
    }

    /// Get the S3 object key for an artifact key
    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Map AWS S3 errors to the crate error type
    fn map_s3_error<E: std::fmt::Debug>(&self, error: SdkError<E>, operation: &str) -> Error {
        match &error {
            SdkError::DispatchFailure(err) => {
                Error::Storage(format!("S3 dispatch error during {}: {:?}", operation, err))
            }
            SdkError::ResponseError(err) => {
                Error::Storage(format!("S3 response error during {}: {:?}", operation, err))
            }
            SdkError::TimeoutError(_) => {
                Error::Storage(format!("S3 timeout during {}: {:?}", operation, error))
            }
            SdkError::ServiceError(_) => {
                Error::Storage(format!("S3 service error during {}: {:?}", operation, error))
            }
            _ => Error::Storage(format!("S3 error during {}: {:?}", operation, error)),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, source: &Path, key: &str) -> Result<u64> {
        let size = tokio::fs::metadata(source).await?.len();
        let object_key = self.object_key(key);

        // Stream the staging file rather than reading it into memory;
        // dumps can run to many gigabytes.
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| Error::Storage(format!("failed to open staging file: {}", e)))?;

        debug!(
            "uploading artifact {} ({} bytes) to s3://{}/{}",
            key, size, self.bucket, object_key
        );
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => {
                info!("uploaded artifact {} ({} bytes)", key, size);
                Ok(size)
            }
            Err(err) => {
                error!("failed to upload artifact to S3: {}", err);
                Err(self.map_s3_error(err, "put"))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_key = self.object_key(key);

        debug!("deleting artifact s3://{}/{}", self.bucket, object_key);
        // S3 DeleteObject succeeds for missing keys, which is exactly the
        // idempotency the pruner relies on.
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("failed to delete artifact from S3: {}", err);
                Err(self.map_s3_error(err, "delete"))
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let object_key = self.object_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let SdkError::ServiceError(service_err) = &err {
                    if service_err.raw().http().status() == 404 {
                        return Ok(false);
                    }
                }
                error!("failed to check artifact existence in S3: {}", err);
                Err(self.map_s3_error(err, "exists"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> S3ArtifactStore {
        let config = aws_types::SdkConfig::builder().build();
        S3ArtifactStore {
            client: S3Client::new(&config),
            bucket: "test-bucket".to_string(),
            prefix: "artifacts/".to_string(),
        }
    }

    #[test]
    fn test_object_key_is_prefixed() {
        let store = provider();
        assert_eq!(
            store.object_key("db/db-1/daily/2025-06-10-abc.sql.gz"),
            "artifacts/db/db-1/daily/2025-06-10-abc.sql.gz"
        );
    }
}
