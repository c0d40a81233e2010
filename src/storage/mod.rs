//! Artifact storage abstraction.
//!
//! Backup artifacts live in object storage; this module abstracts over
//! AWS S3 and a local-filesystem fallback so the executor and pruner are
//! oblivious to the backend.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

pub mod local;
pub mod s3;

/// Storage backend for backup artifacts.
///
/// Keys are unique per job, so puts never contend; deletes must be
/// idempotent because the pruner re-runs after partial failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the file at `source` under `key`, streaming it to the backend.
    /// Returns the stored size in bytes.
    async fn put(&self, source: &Path, key: &str) -> Result<u64>;

    /// Delete the artifact at `key`. Deleting a missing key is not an
    /// error: a crashed prune pass may have removed the artifact already.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an artifact exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Create an artifact store based on the current configuration.
///
/// Checks AWS availability and falls back to local storage when S3 is not
/// configured or not reachable.
pub async fn create_artifact_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    // The local directory is needed even when S3 is primary, as staging space.
    config.ensure_local_artifact_dir().map_err(|e| {
        Error::Config(format!("failed to create local artifact directory: {}", e))
    })?;

    if config.should_use_aws().await {
        match s3::S3ArtifactStore::new(config).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => {
                tracing::warn!(
                    "failed to create S3 artifact store: {}, falling back to local storage",
                    e
                );
            }
        }
    }

    Ok(Arc::new(local::LocalArtifactStore::new(config)))
}
