//! Remote Tier
//!
//! Extension point for a shared cache that lives in another process (Redis,
//! Memcached, ...). A remote tier is a [`Cache`] with a connection lifecycle:
//!
//! ```text
//! Disconnected --connect()--> Connected --close()--> Disconnected
//! ```
//!
//! Operations issued while disconnected fail with
//! [`CacheError::Disconnected`]. [`MockRemoteCache`] is a local stand-in used to
//! exercise the contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::entry::{expiry_after, now_millis};
use super::traits::{effective_ttl, Cache, CacheStats, CacheValue};
use crate::error::{CacheError, Result};

/// Cache tier backed by a remote store
#[async_trait]
pub trait RemoteCache<V: CacheValue>: Cache<V> {
    /// Establish the connection. Connecting twice is a no-op.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Round-trip time to the store
    async fn ping(&self) -> Result<Duration>;
}

/// Mock remote tier configuration
#[derive(Debug, Clone)]
pub struct MockRemoteConfig {
    /// Maximum entries (0 = unbounded); a full store rejects new keys
    pub max_size: usize,
    /// Default TTL for `set` with a zero TTL
    pub ttl: Duration,
    /// Simulated network delay added to every call
    pub latency: Duration,
}

impl Default for MockRemoteConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            ttl: Duration::from_secs(24 * 60 * 60),
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteEntry<V> {
    value: V,
    /// Expiry (epoch millis)
    expire_at: i64,
}

/// In-process stand-in for a remote cache
pub struct MockRemoteCache<V> {
    store: DashMap<String, RemoteEntry<V>>,
    config: MockRemoteConfig,
    connected: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl<V: CacheValue> MockRemoteCache<V> {
    /// Create a disconnected mock
    pub fn new(config: MockRemoteConfig) -> Self {
        Self {
            store: DashMap::new(),
            config,
            connected: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Add a simulated delay to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    /// Writes accepted since creation
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Deletes issued since creation
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    async fn round_trip(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(CacheError::Disconnected);
        }
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = now_millis();
        let before = self.store.len();
        self.store.retain(|_, entry| now <= entry.expire_at);
        before.saturating_sub(self.store.len())
    }
}

impl<V: CacheValue> Default for MockRemoteCache<V> {
    fn default() -> Self {
        Self::new(MockRemoteConfig::default())
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for MockRemoteCache<V> {
    fn name(&self) -> &str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<V> {
        self.round_trip().await?;

        let now = now_millis();
        let found = self.store.get(key).map(|entry| {
            if now > entry.expire_at {
                None
            } else {
                Some(entry.value.clone())
            }
        });

        match found {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Some(None) => {
                self.store.remove_if(key, |_, entry| now_millis() > entry.expire_at);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::miss(key))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::miss(key))
            }
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.round_trip().await?;

        let max_size = self.config.max_size;
        if max_size > 0 && !self.store.contains_key(key) && self.store.len() >= max_size {
            // Expired entries do not count against capacity
            self.purge_expired();
            let size = self.store.len();
            if size >= max_size {
                debug!(tier = "remote", key, size, "rejecting write, store full");
                return Err(CacheError::Full { size, max_size });
            }
        }

        let ttl = effective_ttl(ttl, self.config.ttl);
        self.store.insert(
            key.to_string(),
            RemoteEntry {
                value,
                expire_at: expiry_after(now_millis(), ttl),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.round_trip().await?;
        self.store.remove(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.round_trip().await?;
        self.store.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.store.len(),
            max_size: self.config.max_size,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            ttl: self.config.ttl,
            last_cleanup: None,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(entries = self.store.len(), "remote cache disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl<V: CacheValue> RemoteCache<V> for MockRemoteCache<V> {
    async fn connect(&self) -> Result<()> {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(latency = ?self.config.latency, "remote cache connected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.round_trip().await?;
        Ok(start.elapsed())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    async fn connected(config: MockRemoteConfig) -> MockRemoteCache<String> {
        let cache = MockRemoteCache::new(config);
        cache.connect().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let cache = MockRemoteCache::<String>::default();
        assert!(!cache.is_connected());

        assert_matches!(cache.get("k").await, Err(CacheError::Disconnected));
        assert_matches!(
            cache.set("k", "v".to_string(), Duration::ZERO).await,
            Err(CacheError::Disconnected)
        );
        assert_matches!(cache.ping().await, Err(CacheError::Disconnected));

        cache.connect().await.unwrap();
        cache.connect().await.unwrap();
        assert!(cache.is_connected());
        cache.set("k", "v".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_close_disconnects_and_reconnect_works() {
        let cache = connected(MockRemoteConfig::default()).await;
        cache.set("k", "v".to_string(), Duration::ZERO).await.unwrap();

        cache.close().await.unwrap();
        cache.close().await.unwrap();
        assert!(!cache.is_connected());
        assert_matches!(cache.get("k").await, Err(CacheError::Disconnected));
        assert_eq!(cache.stats().size, 1);

        cache.connect().await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = connected(MockRemoteConfig::default()).await;
        cache
            .set("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get("k").await.unwrap_err().is_miss());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_full_store_rejects_new_keys() {
        let cache = connected(MockRemoteConfig {
            max_size: 2,
            ..Default::default()
        })
        .await;
        cache.set("a", "1".to_string(), Duration::ZERO).await.unwrap();
        cache.set("b", "2".to_string(), Duration::ZERO).await.unwrap();

        assert_matches!(
            cache.set("c", "3".to_string(), Duration::ZERO).await,
            Err(CacheError::Full { size: 2, max_size: 2 })
        );
        // Overwrites still fit
        cache.set("a", "10".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), "10");
    }

    #[tokio::test]
    async fn test_expired_entries_free_capacity() {
        let cache = connected(MockRemoteConfig {
            max_size: 1,
            ..Default::default()
        })
        .await;
        cache
            .set("old", "1".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        cache.set("new", "2".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_latency_is_simulated() {
        let cache = MockRemoteCache::<String>::default().with_latency(Duration::from_millis(30));
        cache.connect().await.unwrap();

        let rtt = cache.ping().await.unwrap();
        assert!(rtt >= Duration::from_millis(30));

        let start = Instant::now();
        let _ = cache.get("k").await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = connected(MockRemoteConfig::default()).await;
        cache.set("a", "1".to_string(), Duration::ZERO).await.unwrap();
        cache.get("a").await.unwrap();
        let _ = cache.get("b").await;

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(cache.writes(), 1);

        cache.clear().await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hit_count + stats.miss_count, 0);
    }
}
