/// Staging of user-selected product photos
///
/// `optimize_and_stage` runs the optimizer and sniffs the result, giving the
/// form a preview without touching storage. `upload` then stores the staged
/// bytes under a fresh randomized key and hands back that key, which is what
/// gets saved on the product. URLs are only built at display time.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::ImageFormat;
use tracing::info;

use crate::error::{StageError, StorageError};
use crate::media::optimizer::{ImageOptimizer, OptimizedBlob};
use crate::storage::ObjectStore;

/// An optimized image held in memory, not yet uploaded
#[derive(Debug, Clone)]
pub struct StagedImage {
    blob: OptimizedBlob,
    format: ImageFormat,
}

impl StagedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.blob.bytes
    }

    pub fn blob(&self) -> &OptimizedBlob {
        &self.blob
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// File extension used for the storage key
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }

    /// Inline `data:` URL the form can show before upload
    pub fn preview_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(self.bytes()))
    }
}

/// Optimizes photos and uploads them to the storage collaborator
#[derive(Clone)]
pub struct ImageStager {
    optimizer: ImageOptimizer,
    store: Arc<dyn ObjectStore>,
}

impl ImageStager {
    pub fn new(optimizer: ImageOptimizer, store: Arc<dyn ObjectStore>) -> Self {
        Self { optimizer, store }
    }

    pub fn optimizer(&self) -> &ImageOptimizer {
        &self.optimizer
    }

    /// Optimize a raw blob and keep it ready for upload
    pub async fn optimize_and_stage(&self, blob: Vec<u8>) -> Result<StagedImage, StageError> {
        let blob = self.optimizer.optimize_async(blob).await?;

        // Pass-through blobs were never decoded, so this is the only type check
        let format = image::guess_format(&blob.bytes).map_err(|_| StageError::NotAnImage)?;

        Ok(StagedImage { blob, format })
    }

    /// Upload a staged image and return its new storage key
    pub async fn upload(&self, staged: &StagedImage) -> Result<String, StorageError> {
        let key = fresh_key(staged.extension());
        self.store.upload(&key, staged.bytes()).await?;

        info!(key = %key, bytes = staged.bytes().len(), "uploaded product image");
        Ok(key)
    }
}

/// Randomized key; replaced files always get a new one
fn fresh_key(extension: &str) -> String {
    format!("{}.{}", uuid::Uuid::new_v4(), extension)
}
