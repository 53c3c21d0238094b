//! Property-Based Tests for the Memory Tier
//!
//! Drives a memory tier with arbitrary operation sequences and checks it
//! against simple reference models.
//!
//! # Test Properties
//!
//! 1. **Capacity**: size never exceeds `max_size`, under every policy
//! 2. **Counters**: hits and misses match a plain map replay
//! 3. **LRU Order**: the survivors match a recency-list model

#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use proptest::prelude::*;

use super::memory::{MemoryCache, MemoryConfig};
use super::policy::PolicyKind;
use super::traits::Cache;

#[derive(Debug, Clone)]
enum Op {
    Set(u8, u32),
    Get(u8),
    Delete(u8),
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Operations over a small key space so keys collide often
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..12, any::<u32>()).prop_map(|(k, v)| Op::Set(k, v)),
        3 => (0u8..12).prop_map(Op::Get),
        1 => (0u8..12).prop_map(Op::Delete),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..200)
}

fn policy_strategy() -> impl Strategy<Value = Option<PolicyKind>> {
    prop_oneof![
        Just(None),
        Just(Some(PolicyKind::Fifo)),
        Just(Some(PolicyKind::Lru)),
        Just(Some(PolicyKind::Lfu)),
    ]
}

fn key(k: u8) -> String {
    format!("key-{}", k)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

fn tier(max_size: usize, policy: Option<PolicyKind>) -> MemoryCache<u32> {
    MemoryCache::new(MemoryConfig {
        max_size,
        ttl: Duration::from_secs(3600),
        cleanup_interval: Duration::ZERO,
        policy,
    })
}

// =============================================================================
// Capacity Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the tier never holds more than max_size entries.
    #[test]
    fn prop_size_never_exceeds_capacity(
        max_size in 1usize..8,
        policy in policy_strategy(),
        ops in ops_strategy(),
    ) {
        let rt = runtime();
        let cache = tier(max_size, policy);

        rt.block_on(async {
            for op in &ops {
                match op {
                    Op::Set(k, v) => cache.set(&key(*k), *v, Duration::ZERO).await?,
                    Op::Get(k) => { let _ = cache.get(&key(*k)).await; }
                    Op::Delete(k) => cache.delete(&key(*k)).await?,
                }
                prop_assert!(cache.stats().size <= max_size);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: the most recent write to a key is never the eviction victim.
    #[test]
    fn prop_latest_write_survives(
        max_size in 1usize..8,
        policy in policy_strategy(),
        ops in ops_strategy(),
    ) {
        let rt = runtime();
        let cache = tier(max_size, policy);

        rt.block_on(async {
            for op in &ops {
                if let Op::Set(k, v) = op {
                    cache.set(&key(*k), *v, Duration::ZERO).await?;
                    prop_assert_eq!(cache.get(&key(*k)).await?, *v);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// =============================================================================
// Counter Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: on an unbounded tier hits and misses match a map replay.
    #[test]
    fn prop_counters_match_model(ops in ops_strategy()) {
        let rt = runtime();
        let cache = tier(0, None);
        let mut model: HashMap<String, u32> = HashMap::new();
        let (mut hits, mut misses) = (0u64, 0u64);

        rt.block_on(async {
            for op in &ops {
                match op {
                    Op::Set(k, v) => {
                        cache.set(&key(*k), *v, Duration::ZERO).await?;
                        model.insert(key(*k), *v);
                    }
                    Op::Get(k) => match model.get(&key(*k)) {
                        Some(expected) => {
                            prop_assert_eq!(cache.get(&key(*k)).await?, *expected);
                            hits += 1;
                        }
                        None => {
                            prop_assert!(cache.get(&key(*k)).await.is_err());
                            misses += 1;
                        }
                    },
                    Op::Delete(k) => {
                        cache.delete(&key(*k)).await?;
                        model.remove(&key(*k));
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;

        let stats = cache.stats();
        prop_assert_eq!(stats.size, model.len());
        prop_assert_eq!(stats.hit_count, hits);
        prop_assert_eq!(stats.miss_count, misses);
        if hits + misses > 0 {
            let expected = hits as f64 / (hits + misses) as f64;
            prop_assert!((stats.hit_rate() - expected).abs() < 1e-9);
        }
    }
}

// =============================================================================
// LRU Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: an LRU tier keeps exactly the keys a recency list keeps.
    #[test]
    fn prop_lru_matches_recency_model(
        max_size in 1usize..6,
        ops in ops_strategy(),
    ) {
        let rt = runtime();
        let cache = tier(max_size, Some(PolicyKind::Lru));
        // Least recent first
        let mut recency: Vec<String> = Vec::new();

        rt.block_on(async {
            for op in &ops {
                match op {
                    Op::Set(k, v) => {
                        let k = key(*k);
                        cache.set(&k, *v, Duration::ZERO).await?;
                        if let Some(pos) = recency.iter().position(|r| *r == k) {
                            recency.remove(pos);
                        } else if recency.len() == max_size {
                            recency.remove(0);
                        }
                        recency.push(k);
                    }
                    Op::Get(k) => {
                        let k = key(*k);
                        let hit = cache.get(&k).await.is_ok();
                        let pos = recency.iter().position(|r| *r == k);
                        prop_assert_eq!(hit, pos.is_some());
                        if let Some(pos) = pos {
                            let touched = recency.remove(pos);
                            recency.push(touched);
                        }
                    }
                    Op::Delete(k) => {
                        let k = key(*k);
                        cache.delete(&k).await?;
                        recency.retain(|r| *r != k);
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;

        let expected: HashSet<&String> = recency.iter().collect();
        for k in 0u8..12 {
            let k = key(k);
            prop_assert_eq!(cache.contains(&k), expected.contains(&k), "key {}", k);
        }
    }
}
