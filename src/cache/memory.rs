//! In-Memory Tier
//!
//! RAM-backed tier for hot entries.
//!
//! # Design
//!
//! - One key map behind a `RwLock`; hits only take the shared lock and refresh
//!   access metadata through atomics
//! - Expiry is lazy on read plus a periodic reaper
//! - Inserting a new key at capacity evicts first: the configured policy picks
//!   the victims, or the oldest creation when no policy is set

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::entry::{estimate_size, now_millis, CacheEntry, EntryMeta, Sequence};
use super::policy::{victims_needed, EvictionPolicy, PolicyKind};
use super::reaper::Reaper;
use super::traits::{effective_ttl, Cache, CacheStats, CacheValue};
use crate::error::{CacheError, Result};

/// Default capacity in entries
pub const DEFAULT_MEMORY_MAX_SIZE: usize = 10_000;

/// Default entry lifetime
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(5 * 60);

/// Default reaper period
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum entries (0 = unbounded)
    pub max_size: usize,
    /// Default TTL for `set` with a zero TTL
    pub ttl: Duration,
    /// Reaper period (zero disables the reaper)
    pub cleanup_interval: Duration,
    /// Eviction policy; `None` evicts the oldest creation
    pub policy: Option<PolicyKind>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MEMORY_MAX_SIZE,
            ttl: DEFAULT_MEMORY_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            policy: None,
        }
    }
}

/// State shared with the reaper task
struct Shared<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    policy: Option<Arc<dyn EvictionPolicy>>,
    seq: Sequence,
    max_size: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    last_cleanup: RwLock<Option<DateTime<Utc>>>,
}

impl<V: CacheValue> Shared<V> {
    fn forget(&self, key: &str) {
        if let Some(policy) = &self.policy {
            policy.on_remove(key);
        }
    }

    /// Two-phase sweep: scan under the read lock, remove under the write lock
    fn purge_expired(&self) -> usize {
        let now = now_millis();
        let expired: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.meta.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        if !expired.is_empty() {
            let mut entries = self.entries.write();
            for key in &expired {
                // May have been overwritten since the scan
                if entries.get(key).is_some_and(|e| e.is_expired()) {
                    entries.remove(key);
                    self.forget(key);
                    removed += 1;
                }
            }
        }

        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        *self.last_cleanup.write() = Some(Utc::now());
        if removed > 0 {
            debug!(tier = "memory", removed, "purged expired entries");
        }
        removed
    }

    /// Evict until one more entry fits
    fn make_room(&self, entries: &mut HashMap<String, CacheEntry<V>>) -> Result<()> {
        let needed = victims_needed(entries.len(), self.max_size);
        if needed == 0 {
            return Ok(());
        }

        let victims = match &self.policy {
            Some(policy) => policy.should_evict(entries.len(), self.max_size),
            None => oldest_created(entries, needed),
        };
        for key in victims {
            if entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(tier = "memory", key = %key, "evicted");
            }
            self.forget(&key);
        }

        if victims_needed(entries.len(), self.max_size) > 0 {
            return Err(CacheError::Full {
                size: entries.len(),
                max_size: self.max_size,
            });
        }
        Ok(())
    }
}

fn oldest_created<V>(entries: &HashMap<String, CacheEntry<V>>, n: usize) -> Vec<String> {
    let mut order: Vec<(u64, &String)> = entries
        .iter()
        .map(|(key, entry)| (entry.meta.create_seq(), key))
        .collect();
    order.sort_unstable();
    order.into_iter().take(n).map(|(_, key)| key.clone()).collect()
}

/// In-memory cache tier
pub struct MemoryCache<V> {
    shared: Arc<Shared<V>>,
    closed: AtomicBool,
    reaper: Reaper,
}

impl<V: CacheValue> MemoryCache<V> {
    /// Create a tier; the reaper starts if a Tokio runtime is available
    pub fn new(config: MemoryConfig) -> Self {
        let policy = config.policy.map(|kind| kind.build());
        Self::build(config, policy)
    }

    /// Create a tier with a caller-supplied policy instance
    pub fn with_policy(config: MemoryConfig, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self::build(config, Some(policy))
    }

    fn build(config: MemoryConfig, policy: Option<Arc<dyn EvictionPolicy>>) -> Self {
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            policy,
            seq: Sequence::new(),
            max_size: config.max_size,
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            last_cleanup: RwLock::new(None),
        });

        let sweeper = shared.clone();
        let reaper = Reaper::spawn("memory", config.cleanup_interval, move || {
            let shared = sweeper.clone();
            async move {
                shared.purge_expired();
            }
        });

        info!(
            max_size = config.max_size,
            ttl = ?config.ttl,
            policy = shared.policy.as_ref().map(|p| p.name()).unwrap_or("oldest"),
            "memory cache opened"
        );

        Self {
            shared,
            closed: AtomicBool::new(false),
            reaper,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Remove every expired entry now
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    /// True if `key` holds a live entry. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.shared
            .entries
            .read()
            .get(key)
            .is_some_and(|e| !e.is_expired())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries removed to make room
    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    /// Entries removed because their TTL elapsed
    pub fn expirations(&self) -> u64 {
        self.shared.expirations.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for MemoryCache<V> {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<V> {
        self.ensure_open()?;
        let shared = &self.shared;

        {
            let entries = shared.entries.read();
            match entries.get(key) {
                None => {
                    shared.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(CacheError::miss(key));
                }
                Some(entry) if !entry.is_expired() => {
                    entry.meta.record_access(shared.seq.next());
                    if let Some(policy) = &shared.policy {
                        policy.on_access(key, &entry.meta);
                    }
                    shared.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value().clone());
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock before removing
        {
            let mut entries = shared.entries.write();
            if entries.get(key).is_some_and(|e| e.is_expired()) {
                entries.remove(key);
                shared.forget(key);
                shared.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(tier = "memory", key, "expired on read");
            }
        }
        shared.misses.fetch_add(1, Ordering::Relaxed);
        Err(CacheError::miss(key))
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let shared = &self.shared;
        let ttl = effective_ttl(ttl, shared.ttl);
        let size = estimate_size(key, &value);

        let mut entries = shared.entries.write();
        if !entries.contains_key(key) {
            shared.make_room(&mut entries)?;
        }
        let meta = EntryMeta::new(ttl, size, shared.seq.next());
        if let Some(policy) = &shared.policy {
            policy.on_add(key, &meta);
        }
        entries.insert(key.to_string(), CacheEntry::new(value, meta));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut entries = self.shared.entries.write();
        if entries.remove(key).is_some() {
            self.shared.forget(key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let shared = &self.shared;
        {
            let mut entries = shared.entries.write();
            entries.clear();
            if let Some(policy) = &shared.policy {
                policy.clear();
            }
        }
        shared.hits.store(0, Ordering::Relaxed);
        shared.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        CacheStats {
            size: shared.entries.read().len(),
            max_size: shared.max_size,
            hit_count: shared.hits.load(Ordering::Relaxed),
            miss_count: shared.misses.load(Ordering::Relaxed),
            ttl: shared.ttl,
            last_cleanup: *shared.last_cleanup.read(),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.reaper.stop().await;
        info!(entries = self.len(), "memory cache closed");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config(max_size: usize, policy: Option<PolicyKind>) -> MemoryConfig {
        MemoryConfig {
            max_size,
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::ZERO,
            policy,
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new(config(10, None));
        cache.set("AAPL", 187.5_f64, Duration::ZERO).await.unwrap();

        assert_eq!(cache.get("AAPL").await.unwrap(), 187.5);
        assert_matches!(cache.get("MSFT").await, Err(CacheError::Miss { key }) if key == "MSFT");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let cache = MemoryCache::new(config(10, None));
        cache.set("k", 1u32, Duration::ZERO).await.unwrap();
        cache.set("k", 2u32, Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let cache = MemoryCache::new(config(10, None));
        cache
            .set("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_matches!(cache.get("k").await, Err(CacheError::Miss { .. }));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.expirations(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_tier_default() {
        let cache = MemoryCache::new(MemoryConfig {
            ttl: Duration::from_millis(30),
            ..config(10, None)
        });
        cache.set("k", 1u8, Duration::ZERO).await.unwrap();
        assert!(cache.contains("k"));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!cache.contains("k"));
        assert!(cache.get("k").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_default_eviction_is_oldest_created() {
        let cache = MemoryCache::new(config(2, None));
        cache.set("a", 1, Duration::ZERO).await.unwrap();
        cache.set("b", 2, Duration::ZERO).await.unwrap();
        // Access does not save "a" without a policy
        cache.get("a").await.unwrap();
        cache.set("c", 3, Duration::ZERO).await.unwrap();

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn test_lru_policy_keeps_recently_read() {
        let cache = MemoryCache::new(config(2, Some(PolicyKind::Lru)));
        cache.set("a", 1, Duration::ZERO).await.unwrap();
        cache.set("b", 2, Duration::ZERO).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", 3, Duration::ZERO).await.unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test]
    async fn test_lfu_policy_keeps_frequently_read() {
        let cache =
            MemoryCache::with_policy(config(3, None), PolicyKind::Lfu.build());
        for key in ["a", "b", "c"] {
            cache.set(key, 0u8, Duration::ZERO).await.unwrap();
        }
        for _ in 0..3 {
            cache.get("a").await.unwrap();
        }
        cache.get("c").await.unwrap();
        cache.set("d", 0, Duration::ZERO).await.unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let cache = MemoryCache::new(config(2, Some(PolicyKind::Fifo)));
        cache.set("a", 1, Duration::ZERO).await.unwrap();
        cache.set("b", 2, Duration::ZERO).await.unwrap();
        cache.set("a", 10, Duration::ZERO).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
        assert_eq!(cache.get("b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_when_max_size_zero() {
        let cache = MemoryCache::new(config(0, Some(PolicyKind::Lru)));
        for i in 0..500 {
            cache.set(&format!("k{}", i), i, Duration::ZERO).await.unwrap();
        }
        assert_eq!(cache.stats().size, 500);
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = MemoryCache::new(config(10, None));
        cache.set("a", 1, Duration::ZERO).await.unwrap();
        for _ in 0..3 {
            cache.get("a").await.unwrap();
        }
        let _ = cache.get("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 10);
        assert_eq!(stats.hit_count, 3);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.ttl, Duration::from_secs(60));

        cache.clear().await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.miss_count, 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let cache = MemoryCache::<u8>::new(config(10, None));
        cache.delete("nothing").await.unwrap();

        cache.set("k", 1, Duration::ZERO).await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new(config(10, None));
        cache.set("short", 1, Duration::from_millis(10)).await.unwrap();
        cache.set("long", 2, Duration::from_secs(60)).await.unwrap();
        assert!(cache.stats().last_cleanup.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.stats().last_cleanup.is_some());
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_entries() {
        let cache = MemoryCache::new(MemoryConfig {
            cleanup_interval: Duration::from_millis(20),
            ..config(10, None)
        });
        cache.set("k", 1, Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert!(stats.last_cleanup.is_some());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cache = MemoryCache::new(MemoryConfig {
            cleanup_interval: Duration::from_millis(10),
            ..config(10, None)
        });
        cache.set("k", 1, Duration::ZERO).await.unwrap();

        cache.close().await.unwrap();
        cache.close().await.unwrap();
        assert!(cache.is_closed());

        assert_matches!(cache.get("k").await, Err(CacheError::Closed));
        assert_matches!(cache.set("k", 2, Duration::ZERO).await, Err(CacheError::Closed));
        assert_matches!(cache.delete("k").await, Err(CacheError::Closed));
        assert_matches!(cache.clear().await, Err(CacheError::Closed));
        // Stats still answer
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let cache = MemoryCache::new(config(10, None));
        let items: HashMap<String, u32> =
            [("a".to_string(), 1), ("b".to_string(), 2)].into_iter().collect();
        cache.batch_set(items, Duration::ZERO).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = cache.batch_get(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], 1);
        assert!(!found.contains_key("c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_capacity() {
        let cache = Arc::new(MemoryCache::new(config(50, Some(PolicyKind::Lru))));

        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    let key = format!("t{}-{}", t, i);
                    cache.set(&key, i, Duration::ZERO).await.unwrap();
                    let _ = cache.get(&key).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cache.stats().size <= 50);
        assert_eq!(cache.evictions(), 800 - cache.len() as u64);
    }
}
