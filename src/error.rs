/// Error taxonomy for the catalog client
///
/// Every component returns one of these typed failures. Nothing here is
/// fatal to the process: validation errors are caller-correctable, backend
/// errors leave the previous snapshot in place, and optimizer errors only
/// abort the upload attempt they belong to.

use std::sync::Arc;

use thiserror::Error;

/// Failures of the image optimizer
#[derive(Debug, Error)]
pub enum OptimizeError {
    /// Rejected by the size pre-check, before any decode work
    #[error("image is too large ({actual} bytes, limit is {limit} bytes)")]
    TooLarge { actual: u64, limit: u64 },

    /// Malformed or unsupported input
    #[error("could not decode image: {0}")]
    DecodeFailed(#[source] image::ImageError),

    /// Resizing and recompression did not get under the hard cap
    #[error("image is still too large after optimization ({actual} bytes, limit is {limit} bytes)")]
    PostOptimizationStillTooLarge { actual: u64, limit: u64 },

    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("optimizer task failed: {0}")]
    Task(String),
}

/// Failures while preparing a user-selected image for upload
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Optimize(#[from] OptimizeError),

    /// The blob passed the size checks but is not a recognizable image
    #[error("file is not a supported image")]
    NotAnImage,
}

/// Failures of the storage collaborator
#[derive(Debug, Error)]
pub enum StorageError {
    /// An object already exists under this key
    #[error("object already exists: {0}")]
    Conflict(String),

    #[error("object exceeds storage quota ({actual} > {limit} bytes)")]
    QuotaExceeded { actual: u64, limit: u64 },

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the CRUD collaborator
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("product {0} not found")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend task failed: {0}")]
    Task(String),
}

/// Caller-side validation of product fields, checked before any network call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("product name must not be empty")]
    EmptyName,

    #[error("price must be a non-negative number, got {0}")]
    InvalidPrice(f64),

    #[error("stock must not be negative, got {0}")]
    NegativeStock(i64),

    /// Image keys are stored unresolved; a URL at rest is a bug upstream
    #[error("image key must be a storage key, not a URL: {0}")]
    ImageKeyIsUrl(String),
}

/// Failures surfaced by `CatalogSync`
///
/// `Clone` so a single fetch failure can be handed to every coalesced
/// waiter and kept around as the last error.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("invalid product: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to fetch catalog: {0}")]
    FetchFailed(#[source] Arc<BackendError>),

    #[error("backend rejected the change: {0}")]
    BackendFailed(#[source] Arc<BackendError>),

    /// The reload worker is gone (runtime shut down)
    #[error("catalog sync worker stopped")]
    Closed,
}

impl CatalogError {
    pub(crate) fn fetch(err: BackendError) -> Self {
        CatalogError::FetchFailed(Arc::new(err))
    }

    pub(crate) fn backend(err: BackendError) -> Self {
        CatalogError::BackendFailed(Arc::new(err))
    }

    /// Whether the user can fix this by changing their input
    pub fn is_validation(&self) -> bool {
        matches!(self, CatalogError::Validation(_))
    }
}
