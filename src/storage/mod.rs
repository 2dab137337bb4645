/// Storage collaborator and display URL resolution
///
/// - `ObjectStore` is the seam to whatever holds uploaded files
/// - `filesystem` is a directory-backed store for local use
/// - `resolver` turns stored keys into display URLs, memoized

pub mod filesystem;
pub mod resolver;

use async_trait::async_trait;

use crate::error::StorageError;

pub use filesystem::FilesystemStore;
pub use resolver::UrlResolver;

/// Object storage for product images
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`. Fails if the key is taken.
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Public URL for `key`
    ///
    /// Must be a pure function of the key: same key, same URL, no expiry.
    fn public_url(&self, key: &str) -> String;
}

/// Public URL as `<base>/<bucket>/<key>`, tolerant of stray slashes
pub fn join_public_url(base: &str, bucket: &str, key: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        bucket.trim_matches('/'),
        key.trim_start_matches('/')
    )
}
