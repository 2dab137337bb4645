use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{join_public_url, ObjectStore};
use crate::config::StorageConfig;
use crate::error::StorageError;

/// Directory-backed object store
///
/// Objects live flat under `{root}/{bucket}/{key}`. Writes go to a temp file
/// first and are moved into place, so a failed upload never leaves a
/// partial object behind.
pub struct FilesystemStore {
    bucket_dir: PathBuf,
    bucket: String,
    public_base_url: String,
    max_size: u64,
}

impl FilesystemStore {
    /// Create the store, making its directories if needed
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::with_root(config, config.root_dir()).await
    }

    pub async fn with_root(config: &StorageConfig, root: PathBuf) -> Result<Self, StorageError> {
        let bucket_dir = root.join(&config.bucket);
        fs::create_dir_all(bucket_dir.join(".tmp")).await?;

        Ok(Self {
            bucket_dir,
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.clone(),
            max_size: config.max_object_size,
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.bucket_dir.join(key)
    }

    fn temp_path(&self) -> PathBuf {
        self.bucket_dir
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }
}

/// Keys are single path segments
fn check_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && Path::new(key).components().count() == 1
        && !key.contains(['/', '\\']);

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;

        let size = bytes.len() as u64;
        if size > self.max_size {
            return Err(StorageError::QuotaExceeded {
                actual: size,
                limit: self.max_size,
            });
        }

        let object_path = self.object_path(key);
        if fs::try_exists(&object_path).await? {
            return Err(StorageError::Conflict(key.to_string()));
        }

        let temp_path = self.temp_path();
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &object_path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        join_public_url(&self.public_base_url, &self.bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store(max_size: u64) -> (FilesystemStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            public_base_url: "https://cdn.test/public".into(),
            max_object_size: max_size,
            ..StorageConfig::default()
        };
        let store = FilesystemStore::with_root(&config, dir.path().to_path_buf())
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_upload_writes_object() {
        let (store, dir) = temp_store(1024).await;
        store.upload("a.jpg", b"jpeg bytes").await.unwrap();

        let on_disk = std::fs::read(dir.path().join("products/a.jpg")).unwrap();
        assert_eq!(on_disk, b"jpeg bytes");

        // Temp file moved, not copied
        let tmp_entries: Vec<_> = std::fs::read_dir(dir.path().join("products/.tmp"))
            .unwrap()
            .collect();
        assert_eq!(tmp_entries.len(), 0);
    }

    #[tokio::test]
    async fn test_upload_conflict() {
        let (store, _dir) = temp_store(1024).await;
        store.upload("a.jpg", b"first").await.unwrap();

        let result = store.upload("a.jpg", b"second").await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_upload_quota() {
        let (store, _dir) = temp_store(4).await;
        let result = store.upload("a.jpg", b"too many bytes").await;
        assert!(matches!(
            result,
            Err(StorageError::QuotaExceeded { actual: 14, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_path_keys() {
        let (store, _dir) = temp_store(1024).await;
        for key in ["", "../escape.jpg", "nested/a.jpg", ".tmp", ".."] {
            assert!(
                matches!(store.upload(key, b"x").await, Err(StorageError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_public_url_is_deterministic() {
        let (store, _dir) = temp_store(1024).await;
        assert_eq!(store.public_url("a.jpg"), "https://cdn.test/public/products/a.jpg");
        assert_eq!(store.public_url("a.jpg"), store.public_url("a.jpg"));
    }
}
