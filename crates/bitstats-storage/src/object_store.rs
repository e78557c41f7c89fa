//! Object storage for the data file: backup, download, upload.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::{sha256_hex, StorageError};

pub const BACKUP_SUFFIX: &str = "_bak";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub sha256: String,
    pub byte_size: usize,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Server-side copy of `key` to `{key}_bak`.
    async fn backup(&self, key: &str) -> Result<StoredObject, StorageError>;

    /// Fetch `key` into `dest_dir`, returning the local path.
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf, StorageError>;

    async fn upload(&self, local: &Path, key: &str) -> Result<StoredObject, StorageError>;
}

/// Bucket backed by a directory, e.g. a mounted bucket or a shared volume.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn read_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound {
                    bucket: self.root.display().to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading object {}", path.display()))
                .into()),
        }
    }

    async fn write_object(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, StorageError> {
        write_atomic(&self.object_path(key), bytes).await?;
        Ok(StoredObject {
            key: key.to_string(),
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn backup(&self, key: &str) -> Result<StoredObject, StorageError> {
        let bytes = self.read_object(key).await?;
        let backup_key = format!("{key}{BACKUP_SUFFIX}");
        let stored = self.write_object(&backup_key, &bytes).await?;
        info!(key, backup_key = %backup_key, bytes = stored.byte_size, "object backed up");
        Ok(stored)
    }

    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf, StorageError> {
        let bytes = self.read_object(key).await?;
        let dest = dest_dir.join(key);
        write_atomic(&dest, &bytes).await?;
        info!(key, dest = %dest.display(), bytes = bytes.len(), "object downloaded");
        Ok(dest)
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<StoredObject, StorageError> {
        let bytes = fs::read(local)
            .await
            .with_context(|| format!("reading upload source {}", local.display()))?;
        let stored = self.write_object(key, &bytes).await?;
        info!(key, bytes = stored.byte_size, sha256 = %stored.sha256, "object uploaded");
        Ok(stored)
    }
}

/// Write through a temp file in the target directory and rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn backup_copies_to_bak_suffixed_key() {
        let bucket = tempdir().expect("tempdir");
        std::fs::write(bucket.path().join("bitly-stats.db"), b"v1").unwrap();
        let store = FsObjectStore::new(bucket.path());

        let stored = store.backup("bitly-stats.db").await.expect("backup");

        assert_eq!(stored.key, "bitly-stats.db_bak");
        assert_eq!(
            std::fs::read(bucket.path().join("bitly-stats.db_bak")).unwrap(),
            b"v1"
        );
        assert_eq!(
            std::fs::read(bucket.path().join("bitly-stats.db")).unwrap(),
            b"v1"
        );
    }

    #[tokio::test]
    async fn missing_object_is_reported_by_key() {
        let bucket = tempdir().expect("tempdir");
        let store = FsObjectStore::new(bucket.path());

        let err = store.backup("nope.db").await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound { ref key, .. } if key == "nope.db"));

        let work = tempdir().expect("tempdir");
        let err = store.download("nope.db", work.path()).await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn download_then_upload_replaces_object() {
        let bucket = tempdir().expect("tempdir");
        let work = tempdir().expect("tempdir");
        std::fs::write(bucket.path().join("stats.db"), b"before").unwrap();
        let store = FsObjectStore::new(bucket.path());

        let local = store
            .download("stats.db", &work.path().join("nested"))
            .await
            .expect("download");
        assert_eq!(local, work.path().join("nested").join("stats.db"));
        assert_eq!(std::fs::read(&local).unwrap(), b"before");

        std::fs::write(&local, b"after").unwrap();
        let stored = store.upload(&local, "stats.db").await.expect("upload");
        assert_eq!(stored.byte_size, 5);
        assert_eq!(stored.sha256, sha256_hex(b"after"));
        assert_eq!(std::fs::read(bucket.path().join("stats.db")).unwrap(), b"after");

        let leftovers = std::fs::read_dir(bucket.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
