//! Cache Eviction Policies
//!
//! Pluggable strategies deciding which entry leaves a tier that is at capacity.
//! A tier notifies its policy of every insert, hit and removal; the policy keeps
//! its own ordered index so picking a victim never scans the tier's map.
//!
//! | Policy | Victim                                             |
//! |--------|----------------------------------------------------|
//! | FIFO   | oldest creation                                    |
//! | LRU    | oldest access                                      |
//! | LFU    | fewest hits, ties broken by oldest access          |

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::EntryMeta;
use crate::error::CacheError;

/// Strategy consulted by a tier when it is full
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    /// Policy identifier
    fn name(&self) -> &'static str;

    /// A key was inserted or overwritten
    fn on_add(&self, key: &str, meta: &EntryMeta);

    /// A key was read successfully
    fn on_access(&self, key: &str, meta: &EntryMeta);

    /// A key left the tier for any reason
    fn on_remove(&self, key: &str);

    /// Keys to remove so that one more entry fits under `max_size`.
    ///
    /// Returned keys are not forgotten until the tier calls `on_remove`.
    fn should_evict(&self, len: usize, max_size: usize) -> Vec<String>;

    /// Forget every key
    fn clear(&self);
}

/// How many entries must go before inserting one more
#[inline]
pub fn victims_needed(len: usize, max_size: usize) -> usize {
    if max_size == 0 || len < max_size {
        0
    } else {
        len - max_size + 1
    }
}

/// Policy identifier used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Fifo,
    Lru,
    Lfu,
}

impl PolicyKind {
    /// Build a fresh policy instance
    pub fn build(&self) -> Arc<dyn EvictionPolicy> {
        match self {
            PolicyKind::Fifo => Arc::new(FifoPolicy::new()),
            PolicyKind::Lru => Arc::new(LruPolicy::new()),
            PolicyKind::Lfu => Arc::new(LfuPolicy::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Fifo => "fifo",
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(PolicyKind::Fifo),
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            other => Err(CacheError::Config(format!(
                "unknown eviction policy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Ordered Index
// =============================================================================

/// Keys ordered by a rank, lowest rank first
#[derive(Debug)]
struct OrderedIndex<R: Ord + Copy> {
    order: BTreeSet<(R, String)>,
    ranks: HashMap<String, R>,
}

impl<R: Ord + Copy> OrderedIndex<R> {
    fn new() -> Self {
        Self {
            order: BTreeSet::new(),
            ranks: HashMap::new(),
        }
    }

    fn upsert(&mut self, key: &str, rank: R) {
        if let Some(old) = self.ranks.insert(key.to_string(), rank) {
            self.order.remove(&(old, key.to_string()));
        }
        self.order.insert((rank, key.to_string()));
    }

    /// Re-rank only keys already tracked
    fn update(&mut self, key: &str, rank: R) {
        if self.ranks.contains_key(key) {
            self.upsert(key, rank);
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.ranks.remove(key) {
            self.order.remove(&(old, key.to_string()));
        }
    }

    fn lowest(&self, n: usize) -> Vec<String> {
        self.order.iter().take(n).map(|(_, k)| k.clone()).collect()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ranks.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ranks.len()
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// Evicts the entry created first
#[derive(Debug)]
pub struct FifoPolicy {
    index: Mutex<OrderedIndex<u64>>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(OrderedIndex::new()),
        }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_add(&self, key: &str, meta: &EntryMeta) {
        self.index.lock().upsert(key, meta.create_seq());
    }

    fn on_access(&self, _key: &str, _meta: &EntryMeta) {}

    fn on_remove(&self, key: &str) {
        self.index.lock().remove(key);
    }

    fn should_evict(&self, len: usize, max_size: usize) -> Vec<String> {
        match victims_needed(len, max_size) {
            0 => Vec::new(),
            n => self.index.lock().lowest(n),
        }
    }

    fn clear(&self) {
        self.index.lock().clear();
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Evicts the entry accessed least recently
#[derive(Debug)]
pub struct LruPolicy {
    index: Mutex<OrderedIndex<u64>>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(OrderedIndex::new()),
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_add(&self, key: &str, meta: &EntryMeta) {
        self.index.lock().upsert(key, meta.access_seq());
    }

    fn on_access(&self, key: &str, meta: &EntryMeta) {
        self.index.lock().update(key, meta.access_seq());
    }

    fn on_remove(&self, key: &str) {
        self.index.lock().remove(key);
    }

    fn should_evict(&self, len: usize, max_size: usize) -> Vec<String> {
        match victims_needed(len, max_size) {
            0 => Vec::new(),
            n => self.index.lock().lowest(n),
        }
    }

    fn clear(&self) {
        self.index.lock().clear();
    }
}

// =============================================================================
// LFU
// =============================================================================

/// Evicts the entry with the fewest hits; oldest access loses ties
#[derive(Debug)]
pub struct LfuPolicy {
    index: Mutex<OrderedIndex<(u64, u64)>>,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(OrderedIndex::new()),
        }
    }

    #[inline]
    fn rank(meta: &EntryMeta) -> (u64, u64) {
        (meta.hit_count(), meta.access_seq())
    }
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_add(&self, key: &str, meta: &EntryMeta) {
        self.index.lock().upsert(key, Self::rank(meta));
    }

    fn on_access(&self, key: &str, meta: &EntryMeta) {
        self.index.lock().update(key, Self::rank(meta));
    }

    fn on_remove(&self, key: &str) {
        self.index.lock().remove(key);
    }

    fn should_evict(&self, len: usize, max_size: usize) -> Vec<String> {
        match victims_needed(len, max_size) {
            0 => Vec::new(),
            n => self.index.lock().lowest(n),
        }
    }

    fn clear(&self) {
        self.index.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Sequence;
    use std::time::Duration;

    fn meta(seq: &Sequence) -> EntryMeta {
        EntryMeta::new(Duration::from_secs(60), 1, seq.next())
    }

    #[test]
    fn test_victims_needed() {
        assert_eq!(victims_needed(0, 0), 0);
        assert_eq!(victims_needed(100, 0), 0);
        assert_eq!(victims_needed(1, 2), 0);
        assert_eq!(victims_needed(2, 2), 1);
        assert_eq!(victims_needed(5, 2), 4);
    }

    #[test]
    fn test_policy_kind_parsing() {
        assert_eq!("LRU".parse::<PolicyKind>().unwrap(), PolicyKind::Lru);
        assert_eq!(" lfu ".parse::<PolicyKind>().unwrap(), PolicyKind::Lfu);
        assert_eq!(PolicyKind::default(), PolicyKind::Fifo);
        assert!("arc".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::Lfu.build().name(), "lfu");
    }

    #[test]
    fn test_fifo_evicts_oldest_creation() {
        let seq = Sequence::new();
        let policy = FifoPolicy::new();

        let a = meta(&seq);
        let b = meta(&seq);
        policy.on_add("a", &a);
        policy.on_add("b", &b);

        // Access does not matter for FIFO
        a.record_access(seq.next());
        policy.on_access("a", &a);

        assert_eq!(policy.should_evict(2, 2), vec!["a".to_string()]);
    }

    #[test]
    fn test_fifo_overwrite_moves_to_back() {
        let seq = Sequence::new();
        let policy = FifoPolicy::new();

        policy.on_add("a", &meta(&seq));
        policy.on_add("b", &meta(&seq));
        policy.on_add("a", &meta(&seq));

        assert_eq!(policy.should_evict(2, 2), vec!["b".to_string()]);
        assert_eq!(policy.index.lock().len(), 2);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let seq = Sequence::new();
        let policy = LruPolicy::new();

        let metas: Vec<_> = (0..3).map(|_| meta(&seq)).collect();
        for (i, m) in metas.iter().enumerate() {
            policy.on_add(&format!("k{}", i), m);
        }

        metas[0].record_access(seq.next());
        policy.on_access("k0", &metas[0]);

        assert_eq!(policy.should_evict(3, 3), vec!["k1".to_string()]);
    }

    #[test]
    fn test_lfu_evicts_least_frequent_with_recency_tiebreak() {
        let seq = Sequence::new();
        let policy = LfuPolicy::new();

        let hot = meta(&seq);
        let cold_old = meta(&seq);
        let cold_new = meta(&seq);
        policy.on_add("hot", &hot);
        policy.on_add("cold_old", &cold_old);
        policy.on_add("cold_new", &cold_new);

        for _ in 0..3 {
            hot.record_access(seq.next());
            policy.on_access("hot", &hot);
        }

        assert_eq!(policy.should_evict(3, 3), vec!["cold_old".to_string()]);

        cold_old.record_access(seq.next());
        policy.on_access("cold_old", &cold_old);
        assert_eq!(policy.should_evict(3, 3), vec!["cold_new".to_string()]);
    }

    #[test]
    fn test_access_of_untracked_key_is_ignored() {
        let seq = Sequence::new();
        let policy = LruPolicy::new();
        policy.on_access("ghost", &meta(&seq));
        assert!(policy.should_evict(1, 1).is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let seq = Sequence::new();
        let policy = LruPolicy::new();
        policy.on_add("a", &meta(&seq));
        policy.on_add("b", &meta(&seq));

        policy.on_remove("a");
        assert_eq!(policy.should_evict(1, 1), vec!["b".to_string()]);

        policy.clear();
        assert!(policy.should_evict(1, 1).is_empty());
    }

    #[test]
    fn test_no_eviction_below_capacity_or_unbounded() {
        let seq = Sequence::new();
        let policy = FifoPolicy::new();
        policy.on_add("a", &meta(&seq));
        assert!(policy.should_evict(1, 5).is_empty());
        assert!(policy.should_evict(1, 0).is_empty());
    }
}
