/// Storage key → display URL resolution
///
/// Keys are normalized to their last path segment before lookup, since
/// older product rows hold full paths (or even full URLs) while newer ones
/// hold bare keys. Missing keys map to a fixed placeholder without touching
/// the cache or the store.
///
/// The cache is never evicted. Keys are never reused after a replacement
/// upload, so an entry can't go stale, and the cache is bounded by the size
/// of the catalog.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::ObjectStore;

#[derive(Clone)]
pub struct UrlResolver {
    store: Arc<dyn ObjectStore>,
    placeholder: String,
    cache: Arc<DashMap<String, String>>,
}

impl UrlResolver {
    pub fn new(store: Arc<dyn ObjectStore>, placeholder: impl Into<String>) -> Self {
        Self {
            store,
            placeholder: placeholder.into(),
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Resolve an optional storage key to a URL
    pub fn resolve(&self, key: Option<&str>) -> String {
        let Some(key) = key.and_then(normalize_key) else {
            return self.placeholder.clone();
        };

        if let Some(url) = self.cache.get(key) {
            return url.clone();
        }

        // Two callers may both miss and both compute; the URL is a pure
        // function of the key, so either insert is the same value.
        let url = self.store.public_url(key);
        trace!(key, url = %url, "resolved storage key");
        self.cache.entry(key.to_string()).or_insert(url).clone()
    }

    /// Number of memoized keys
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

/// Trailing filename-like segment of a key, or `None` if there isn't one
pub fn normalize_key(key: &str) -> Option<&str> {
    let segment = key.trim().rsplit('/').next()?.trim();
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}
