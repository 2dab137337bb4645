use async_trait::async_trait;

use super::data::{ProductFields, ProductRecord};
use crate::error::BackendError;

/// CRUD collaborator for the `products` table
///
/// Implementations are passed into `CatalogSync` explicitly so tests can
/// substitute fakes.
#[async_trait]
pub trait ProductBackend: Send + Sync {
    /// All products, newest first
    async fn list_products(&self) -> Result<Vec<ProductRecord>, BackendError>;

    /// A single product
    async fn get_product(&self, id: i64) -> Result<ProductRecord, BackendError>;

    /// Insert and return the stored row with its backend-assigned fields
    async fn insert_product(&self, fields: &ProductFields) -> Result<ProductRecord, BackendError>;

    async fn update_product(&self, id: i64, fields: &ProductFields) -> Result<(), BackendError>;

    async fn delete_product(&self, id: i64) -> Result<(), BackendError>;
}
