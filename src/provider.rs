//! Cache-Aside Access to an Upstream Provider
//!
//! [`CacheAside`] answers from the cache where it can and asks the provider
//! (for example the quote API client) only for the keys the cache lacks.
//! Fetched values are stored before being returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheValue};
use crate::error::{BoxError, CacheError, Result};

/// Upstream data source
#[async_trait]
pub trait Provider<V: CacheValue>: Send + Sync {
    /// Fetch `keys`; keys the source does not know are simply absent
    async fn fetch(&self, keys: &[String]) -> std::result::Result<HashMap<String, V>, BoxError>;
}

/// Cache-aside wrapper over any cache and provider
pub struct CacheAside<V: CacheValue, P: Provider<V>> {
    cache: Arc<dyn Cache<V>>,
    provider: P,
    /// TTL for fetched values (zero = cache default)
    ttl: Duration,
}

impl<V: CacheValue, P: Provider<V>> CacheAside<V, P> {
    pub fn new(cache: Arc<dyn Cache<V>>, provider: P, ttl: Duration) -> Self {
        Self {
            cache,
            provider,
            ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache<V>> {
        &self.cache
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Values for `keys`, fetching only the cache misses.
    ///
    /// Keys unknown to both the cache and the provider are absent from the
    /// result. A provider failure surfaces as [`CacheError::Upstream`].
    pub async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, V>> {
        let mut found = self.cache.batch_get(keys).await?;

        let mut seen = HashSet::new();
        let missing: Vec<String> = keys
            .iter()
            .filter(|key| !found.contains_key(*key) && seen.insert(key.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }

        debug!(
            cached = found.len(),
            fetching = missing.len(),
            "fetching cache misses from provider"
        );
        let fetched = self
            .provider
            .fetch(&missing)
            .await
            .map_err(|source| CacheError::Upstream { source })?;

        for (key, value) in &fetched {
            if let Err(e) = self.cache.set(key, value.clone(), self.ttl).await {
                warn!(key = %key, "failed to cache fetched value: {}", e);
            }
        }
        found.extend(fetched);
        Ok(found)
    }

    /// Single-key form of [`get_many`](Self::get_many)
    pub async fn get(&self, key: &str) -> Result<V> {
        let keys = [key.to_string()];
        self.get_many(&keys)
            .await?
            .remove(key)
            .ok_or_else(|| CacheError::miss(key))
    }
}

// =============================================================================
// Tests
// =============================================================================
