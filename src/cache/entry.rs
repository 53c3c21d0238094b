//! Cache Entry Types
//!
//! Per-entry metadata shared by every tier and every eviction policy. Access
//! tracking uses atomics so a hit can refresh it while only holding a read lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current wall-clock time in epoch milliseconds
#[inline]
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC timestamp, saturating out-of-range values
pub(crate) fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Epoch milliseconds at which an entry written now with `ttl` expires
pub(crate) fn expiry_after(now: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now.saturating_add(ttl_ms)
}

/// Rough in-memory footprint of a value stored under `key`
pub(crate) fn estimate_size<V>(key: &str, _value: &V) -> u64 {
    (key.len() + std::mem::size_of::<V>() + std::mem::size_of::<EntryMeta>()) as u64
}

/// Monotonic logical clock, one per tier.
///
/// Policies order entries by these ticks rather than wall-clock time so two
/// operations inside the same millisecond still have a strict order.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next tick
    #[inline]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Metadata for one cached entry
#[derive(Debug)]
pub struct EntryMeta {
    /// Creation timestamp (epoch millis)
    create_time: i64,
    /// Expiry timestamp (epoch millis)
    expire_time: i64,
    /// Last access timestamp (epoch millis)
    access_time: AtomicI64,
    /// Successful reads of this entry
    hit_count: AtomicU64,
    /// Estimated footprint in bytes
    size: u64,
    /// Logical creation tick
    create_seq: u64,
    /// Logical last-access tick
    access_seq: AtomicU64,
}

impl EntryMeta {
    /// Fresh metadata for an entry created now
    pub fn new(ttl: Duration, size: u64, seq: u64) -> Self {
        let now = now_millis();
        Self {
            create_time: now,
            expire_time: expiry_after(now, ttl),
            access_time: AtomicI64::new(now),
            hit_count: AtomicU64::new(0),
            size,
            create_seq: seq,
            access_seq: AtomicU64::new(seq),
        }
    }

    /// Rebuild metadata from persisted values
    pub fn restore(
        create_time: DateTime<Utc>,
        access_time: DateTime<Utc>,
        expire_time: DateTime<Utc>,
        hit_count: u64,
        size: u64,
        seq: u64,
    ) -> Self {
        Self {
            create_time: create_time.timestamp_millis(),
            expire_time: expire_time.timestamp_millis(),
            access_time: AtomicI64::new(access_time.timestamp_millis()),
            hit_count: AtomicU64::new(hit_count),
            size,
            create_seq: seq,
            access_seq: AtomicU64::new(seq),
        }
    }

    /// Record a hit and return the new hit count
    #[inline]
    pub fn record_access(&self, seq: u64) -> u64 {
        self.access_time.store(now_millis(), Ordering::Relaxed);
        self.access_seq.fetch_max(seq, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    #[inline]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expire_time
    }

    /// Time left before expiry, zero once expired
    pub fn ttl_remaining(&self) -> Duration {
        let left = self.expire_time.saturating_sub(now_millis());
        Duration::from_millis(left.max(0) as u64)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        to_datetime(self.create_time)
    }

    pub fn access_time(&self) -> DateTime<Utc> {
        to_datetime(self.access_time.load(Ordering::Relaxed))
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        to_datetime(self.expire_time)
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn create_seq(&self) -> u64 {
        self.create_seq
    }

    #[inline]
    pub fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }
}

impl Clone for EntryMeta {
    fn clone(&self) -> Self {
        Self {
            create_time: self.create_time,
            expire_time: self.expire_time,
            access_time: AtomicI64::new(self.access_time.load(Ordering::Relaxed)),
            hit_count: AtomicU64::new(self.hit_count.load(Ordering::Relaxed)),
            size: self.size,
            create_seq: self.create_seq,
            access_seq: AtomicU64::new(self.access_seq.load(Ordering::Relaxed)),
        }
    }
}

/// A stored value together with its metadata
#[derive(Clone)]
pub struct CacheEntry<V> {
    value: V,
    /// Entry metadata
    pub meta: EntryMeta,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, meta: EntryMeta) -> Self {
        Self { value, meta }
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.meta.is_expired()
    }
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.meta.size())
            .field("hit_count", &self.meta.hit_count())
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let seq = Sequence::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }

    #[test]
    fn test_meta_access_tracking() {
        let meta = EntryMeta::new(Duration::from_secs(60), 128, 1);
        assert_eq!(meta.hit_count(), 0);
        assert_eq!(meta.access_seq(), 1);

        assert_eq!(meta.record_access(5), 1);
        assert_eq!(meta.record_access(7), 2);
        assert_eq!(meta.access_seq(), 7);
        assert_eq!(meta.create_seq(), 1);
    }

    #[test]
    fn test_access_seq_never_moves_backwards() {
        let meta = EntryMeta::new(Duration::from_secs(60), 1, 10);
        meta.record_access(4);
        assert_eq!(meta.access_seq(), 10);
    }

    #[test]
    fn test_meta_expiry() {
        let live = EntryMeta::new(Duration::from_secs(3600), 1, 1);
        assert!(!live.is_expired());
        assert!(live.ttl_remaining() > Duration::from_secs(3500));

        let meta = EntryMeta::new(Duration::from_millis(10), 1, 1);
        let later = now_millis() + 1_000;
        assert!(meta.is_expired_at(later));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let meta = EntryMeta::new(Duration::MAX, 1, 1);
        assert!(!meta.is_expired());
        assert!(meta.expire_time() > Utc::now());
    }

    #[test]
    fn test_restore_round_trips_timestamps() {
        let created = to_datetime(1_700_000_000_000);
        let accessed = to_datetime(1_700_000_001_000);
        let expires = to_datetime(1_700_000_060_000);

        let meta = EntryMeta::restore(created, accessed, expires, 9, 42, 3);
        assert_eq!(meta.create_time(), created);
        assert_eq!(meta.access_time(), accessed);
        assert_eq!(meta.expire_time(), expires);
        assert_eq!(meta.hit_count(), 9);
        assert_eq!(meta.size(), 42);
    }

    #[test]
    fn test_meta_clone_copies_counters() {
        let meta = EntryMeta::new(Duration::from_secs(1), 1, 1);
        meta.record_access(2);
        meta.record_access(3);

        let cloned = meta.clone();
        assert_eq!(cloned.hit_count(), 2);
        assert_eq!(cloned.access_seq(), 3);
    }

    #[test]
    fn test_entry_debug() {
        let entry = CacheEntry::new("quote", EntryMeta::new(Duration::from_secs(1), 5, 1));
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("hit_count"));
        assert_eq!(*entry.value(), "quote");
    }
}
