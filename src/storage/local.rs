//! Local filesystem implementation of the ArtifactStore trait.
//!
//! Used when AWS is unavailable or disabled; artifact keys map directly to
//! paths under the configured root directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tracing::debug;

use super::ArtifactStore;
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Stores backup artifacts on the local filesystem
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.local_artifact_dir.clone(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are generated internally, but reject traversal anyway.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(Error::Storage(format!("invalid artifact key: {}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, source: &Path, key: &str) -> Result<u64> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let size = tokio_fs::copy(source, &dest).await?;
        debug!("stored artifact {} ({} bytes) at {}", key, size, dest.display());
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Already gone: a previous prune pass got this far.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio_fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> LocalArtifactStore {
        LocalArtifactStore {
            root: dir.to_path_buf(),
        }
    }

    async fn write_source(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("dump.sql");
        tokio_fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_creates_nested_key_paths() {
        let root = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let store = store_in(root.path());

        let source = write_source(staging.path(), b"-- dump").await;
        let size = store.put(&source, "db/db-1/daily/2025-06-10-abc.sql").await.unwrap();

        assert_eq!(size, 7);
        assert!(store.exists("db/db-1/daily/2025-06-10-abc.sql").await.unwrap());
        let stored = tokio_fs::read(root.path().join("db/db-1/daily/2025-06-10-abc.sql"))
            .await
            .unwrap();
        assert_eq!(stored, b"-- dump");
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        let root = tempdir().unwrap();
        let store = store_in(root.path());

        store.delete("db/db-1/daily/nothing.sql").await.unwrap();
        assert!(!store.exists("db/db-1/daily/nothing.sql").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_artifact() {
        let root = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let store = store_in(root.path());

        let source = write_source(staging.path(), b"data").await;
        store.put(&source, "db/db-1/hourly/k.sql").await.unwrap();
        store.delete("db/db-1/hourly/k.sql").await.unwrap();
        assert!(!store.exists("db/db-1/hourly/k.sql").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let root = tempdir().unwrap();
        let store = store_in(root.path());
        assert!(store.exists("../escape.sql").await.is_err());
        assert!(store.delete("/etc/passwd").await.is_err());
    }
}
