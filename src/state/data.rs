/// Shared data structures for the catalog
///
/// These structs represent the data model that flows between the backend
/// and the UI layer. Rows at rest (`ProductRecord`) carry storage keys;
/// display rows (`Product`) additionally carry the resolved URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A product row as the backend stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// Assigned by the backend
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub description: Option<String>,
    pub stock: i64,
    /// Storage key, never a URL
    pub image_key: Option<String>,
    /// Assigned by the backend
    pub created_at: DateTime<Utc>,
}

/// Editable fields of a product, as submitted by the admin form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub description: Option<String>,
    pub stock: i64,
    #[serde(default)]
    pub image_key: Option<String>,
}

impl ProductFields {
    pub fn new(name: impl Into<String>, price: f64, stock: i64) -> Self {
        Self {
            name: name.into(),
            price,
            description: None,
            stock,
            image_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_image_key(mut self, key: impl Into<String>) -> Self {
        self.image_key = Some(key.into());
        self
    }

    /// Check the fields before they are sent anywhere
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(ValidationError::InvalidPrice(self.price));
        }
        if self.stock < 0 {
            return Err(ValidationError::NegativeStock(self.stock));
        }
        if let Some(key) = &self.image_key {
            if key.contains("://") {
                return Err(ValidationError::ImageKeyIsUrl(key.clone()));
            }
        }
        Ok(())
    }

    /// Trimmed copy; blank optional fields become `None`
    pub fn normalized(&self) -> Self {
        let blank_to_none = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            name: self.name.trim().to_string(),
            price: self.price,
            description: blank_to_none(&self.description),
            stock: self.stock,
            image_key: blank_to_none(&self.image_key),
        }
    }
}

impl From<&ProductRecord> for ProductFields {
    fn from(record: &ProductRecord) -> Self {
        Self {
            name: record.name.clone(),
            price: record.price,
            description: record.description.clone(),
            stock: record.stock,
            image_key: record.image_key.clone(),
        }
    }
}

/// A product ready for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub description: Option<String>,
    pub stock: i64,
    /// Unresolved key, kept so edits can round-trip it
    pub image_key: Option<String>,
    /// Resolved URL, or the placeholder
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn from_record(record: ProductRecord, image_url: String) -> Self {
        Self {
            id: record.id,
            name: record.name,
            price: record.price,
            description: record.description,
            stock: record.stock,
            image_key: record.image_key,
            image_url,
            created_at: record.created_at,
        }
    }

    pub fn in_stock(&self) -> bool {
        self.stock > 0
    }
}

/// The fully materialized product list, newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogSnapshot {
    products: Vec<Product>,
    /// Increments on every successful reload; 0 means never loaded
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    pub(crate) fn new(products: Vec<Product>, generation: u64) -> Self {
        Self {
            products,
            generation,
            loaded_at: Some(Utc::now()),
        }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, id: i64) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Product> {
        self.products.iter()
    }
}

impl<'a> IntoIterator for &'a CatalogSnapshot {
    type Item = &'a Product;
    type IntoIter = std::slice::Iter<'a, Product>;

    fn into_iter(self) -> Self::IntoIter {
        self.products.iter()
    }
}
