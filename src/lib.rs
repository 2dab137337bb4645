//! Storefront catalog client core.
//!
//! Three pieces, leaf to root:
//! - [`media::ImageOptimizer`] shrinks product photos before upload
//! - [`storage::UrlResolver`] turns storage keys into display URLs
//! - [`state::catalog::CatalogSync`] keeps the product list in step with the backend

pub mod config;
pub mod error;
pub mod media;
pub mod state;
pub mod storage;

pub use config::StorefrontConfig;
pub use error::{BackendError, CatalogError, OptimizeError, StageError, StorageError, ValidationError};
pub use state::backend::ProductBackend;
pub use state::catalog::{CatalogSync, Subscription, SyncState};
pub use state::data::{CatalogSnapshot, Product, ProductFields, ProductRecord};
pub use state::events::{ChangeBus, ChangeEvent, ChangeFeed, ChangeKind, ChangeOrigin};
pub use state::library::Library;
