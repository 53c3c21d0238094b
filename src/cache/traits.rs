//! Cache Contract
//!
//! The one interface every tier implements. The layered cache, the cache-aside
//! wrapper and the CLI only ever talk to tiers through [`Cache`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Bound every cached value type satisfies
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// Point-in-time statistics of one tier (or of the whole composite)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Entries currently stored
    pub size: usize,
    /// Capacity in entries (0 = unbounded)
    pub max_size: usize,
    /// Successful gets since the last clear
    pub hit_count: u64,
    /// Failed gets since the last clear
    pub miss_count: u64,
    /// Default TTL of the tier
    pub ttl: Duration,
    /// When the reaper last ran
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Hit ratio derived from the counters, 0.0 with no traffic
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size={}/{} hits={} misses={} hit_rate={:.3} ttl={:?}",
            self.size,
            self.max_size,
            self.hit_count,
            self.miss_count,
            self.hit_rate(),
            self.ttl
        )?;
        if let Some(at) = self.last_cleanup {
            write!(f, " last_cleanup={}", at.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Shared interface of every cache tier.
///
/// `ttl == Duration::ZERO` on `set` selects the tier's default TTL. `get` fails
/// with [`CacheError::Miss`](crate::error::CacheError::Miss) for absent and for
/// expired keys alike.
#[async_trait]
pub trait Cache<V: CacheValue>: Send + Sync {
    /// Short tier name for logs
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<V>;

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()>;

    /// Removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every entry and reset hit/miss counters
    async fn clear(&self) -> Result<()>;

    /// Never blocks on I/O
    fn stats(&self) -> CacheStats;

    /// Idempotent; later operations fail
    async fn close(&self) -> Result<()>;

    /// Found keys only; a miss is signalled by absence
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, V>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(value) => {
                    found.insert(key.clone(), value);
                }
                Err(e) if e.is_miss() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    async fn batch_set(&self, items: HashMap<String, V>, ttl: Duration) -> Result<()> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

/// Resolve a caller TTL against a tier default
#[inline]
pub(crate) fn effective_ttl(ttl: Duration, default: Duration) -> Duration {
    if ttl.is_zero() {
        default
    } else {
        ttl
    }
}

// =============================================================================
// Tests
// =============================================================================
