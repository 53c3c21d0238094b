//! Layered Cache Metrics
//!
//! Composite counters owned by the layered cache. All counters are atomics so
//! recording never contends with any tier lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// EMA smoothing factor for latencies
const LATENCY_ALPHA: f64 = 0.1;

/// Composite metrics collector
#[derive(Debug, Default)]
pub struct LayeredMetrics {
    // Lookups, counted once per logical get
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,

    // Promotion
    promotions: AtomicU64,
    promotions_dropped: AtomicU64,
    promotions_failed: AtomicU64,

    // Write propagation
    write_through: AtomicU64,
    write_back: AtomicU64,
    write_back_failed: AtomicU64,

    // Get latency (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
}

impl LayeredMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_dropped(&self) {
        self.promotions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_failed(&self) {
        self.promotions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_through(&self) {
        self.write_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_back(&self) {
        self.write_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_back_failed(&self) {
        self.write_back_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, duration: Duration) {
        let new_us = duration.as_micros().min(u64::MAX as u128) as u64;

        loop {
            let current = self.get_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
            };

            if self
                .get_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn write_back(&self) -> u64 {
        self.write_back.load(Ordering::Relaxed)
    }

    /// Zero the lookup counters only
    pub fn reset_lookups(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotions_dropped: self.promotions_dropped.load(Ordering::Relaxed),
            promotions_failed: self.promotions_failed.load(Ordering::Relaxed),
            write_through: self.write_through.load(Ordering::Relaxed),
            write_back: self.write_back.load(Ordering::Relaxed),
            write_back_failed: self.write_back_failed.load(Ordering::Relaxed),
            get_latency: Duration::from_micros(self.get_latency_us.load(Ordering::Relaxed)),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.reset_lookups();
        self.sets.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.promotions_dropped.store(0, Ordering::Relaxed);
        self.promotions_failed.store(0, Ordering::Relaxed);
        self.write_through.store(0, Ordering::Relaxed);
        self.write_back.store(0, Ordering::Relaxed);
        self.write_back_failed.store(0, Ordering::Relaxed);
        self.get_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of [`LayeredMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub promotions: u64,
    pub promotions_dropped: u64,
    pub promotions_failed: u64,
    pub write_through: u64,
    pub write_back: u64,
    pub write_back_failed: u64,
    pub get_latency: Duration,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Measures one operation
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = LayeredMetrics::new();
        metrics.record_hit();
        metrics.record_hits(2);
        metrics.record_miss();
        metrics.record_promotion();
        metrics.record_promotion_dropped();
        metrics.record_write_back();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.promotions, 1);
        assert_eq!(snap.promotions_dropped, 1);
        assert_eq!(snap.write_back, 1);
        assert!((snap.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = LayeredMetrics::new();
        metrics.record_get_latency(Duration::from_micros(100));
        assert_eq!(metrics.snapshot().get_latency, Duration::from_micros(100));

        metrics.record_get_latency(Duration::from_micros(200));
        // 0.9 * 100 + 0.1 * 200
        let latency = metrics.snapshot().get_latency.as_micros();
        assert!((109..=110).contains(&latency));
    }

    #[test]
    fn test_reset_lookups_keeps_other_counters() {
        let metrics = LayeredMetrics::new();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_write_through();

        metrics.reset_lookups();
        let snap = metrics.snapshot();
        assert_eq!(snap.hits + snap.misses, 0);
        assert_eq!(snap.write_through, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(2));
        assert!(tracker.elapsed() >= Duration::from_millis(2));
    }
}
