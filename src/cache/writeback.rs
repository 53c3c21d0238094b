//! Write-Back Buffer
//!
//! With write-back enabled a composite `set` only writes the first tier and
//! records the value here. A flusher task propagates the buffer to the lower
//! tiers when the interval elapses or the buffer reaches its threshold.
//!
//! An entry stays readable through [`WriteBack::pending_value`] until a
//! flush has written it, so a first tier eviction never exposes an older
//! value from below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::layered::{bounded, Layer};
use super::metrics::LayeredMetrics;
use super::traits::CacheValue;

struct Pending<V> {
    value: V,
    /// Caller TTL; zero defers to each tier
    ttl: Duration,
    recorded: Instant,
    /// Bumped on every record so a flush only retires what it wrote
    version: u64,
}

impl<V> Pending<V> {
    fn is_live(&self) -> bool {
        self.ttl.is_zero() || self.recorded.elapsed() < self.ttl
    }
}

struct Buffer<V> {
    dirty: Mutex<HashMap<String, Pending<V>>>,
    versions: AtomicU64,
    wake: Notify,
    threshold: usize,
    /// Serializes flushes so an older batch never lands after a newer one
    flushing: tokio::sync::Mutex<()>,
    layers: Arc<[Layer<V>]>,
    metrics: Arc<LayeredMetrics>,
    timeout: Option<Duration>,
}

impl<V: CacheValue> Buffer<V> {
    async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;
        let batch: Vec<(String, V, Duration, u64)> = self
            .dirty
            .lock()
            .iter()
            .map(|(key, p)| (key.clone(), p.value.clone(), p.ttl, p.version))
            .collect();
        if batch.is_empty() {
            return 0;
        }

        // The first enabled layer already holds the value
        let targets: Vec<&Layer<V>> = self
            .layers
            .iter()
            .filter(|layer| layer.is_enabled())
            .skip(1)
            .collect();

        let mut flushed = 0;
        for (key, value, ttl, version) in batch {
            let mut failed = false;
            for layer in &targets {
                let write = layer.cache.set(&key, value.clone(), ttl);
                if let Err(e) = bounded(self.timeout, "write_back", write).await {
                    failed = true;
                    warn!(key = %key, layer = layer.name(), "write-back failed: {}", e);
                }
            }
            if failed {
                self.metrics.record_write_back_failed();
            } else {
                self.metrics.record_write_back();
                flushed += 1;
            }

            // A newer record for the key waits for the next flush
            {
                let mut dirty = self.dirty.lock();
                if dirty.get(&key).is_some_and(|p| p.version == version) {
                    dirty.remove(&key);
                }
            }
        }
        debug!(flushed, "write-back flush complete");
        flushed
    }
}

pub(crate) struct WriteBack<V> {
    buffer: Arc<Buffer<V>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<V: CacheValue> WriteBack<V> {
    /// Start the flusher on the current runtime
    pub(crate) fn spawn(
        layers: Arc<[Layer<V>]>,
        metrics: Arc<LayeredMetrics>,
        interval: Duration,
        threshold: usize,
        timeout: Option<Duration>,
    ) -> Self {
        let buffer = Arc::new(Buffer {
            dirty: Mutex::new(HashMap::new()),
            versions: AtomicU64::new(0),
            wake: Notify::new(),
            threshold,
            flushing: tokio::sync::Mutex::new(()),
            layers,
            metrics,
            timeout,
        });

        let token = CancellationToken::new();
        let stop = token.clone();
        let flusher = buffer.clone();
        let handle = tokio::spawn(async move {
            loop {
                let tick = async {
                    if interval.is_zero() {
                        std::future::pending::<()>().await
                    } else {
                        tokio::time::sleep(interval).await
                    }
                };
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick => {}
                    _ = flusher.wake.notified() => {}
                }
                flusher.flush().await;
            }
            debug!("write-back flusher stopped");
        });

        Self {
            buffer,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Remember the latest value for `key`
    pub(crate) fn record(&self, key: &str, value: V, ttl: Duration) {
        let pending = Pending {
            value,
            ttl,
            recorded: Instant::now(),
            version: self.buffer.versions.fetch_add(1, Ordering::Relaxed),
        };
        let pending = {
            let mut dirty = self.buffer.dirty.lock();
            dirty.insert(key.to_string(), pending);
            dirty.len()
        };
        if self.buffer.threshold > 0 && pending >= self.buffer.threshold {
            self.buffer.wake.notify_one();
        }
    }

    /// Value recorded for `key` that a flush has not yet written
    pub(crate) fn pending_value(&self, key: &str) -> Option<V> {
        self.buffer
            .dirty
            .lock()
            .get(key)
            .filter(|p| p.is_live())
            .map(|p| p.value.clone())
    }

    pub(crate) fn discard(&self, key: &str) {
        self.buffer.dirty.lock().remove(key);
    }

    pub(crate) fn discard_all(&self) {
        self.buffer.dirty.lock().clear();
    }

    pub(crate) fn pending(&self) -> usize {
        self.buffer.dirty.lock().len()
    }

    /// Propagate everything buffered now
    pub(crate) async fn flush(&self) -> usize {
        self.buffer.flush().await
    }

    /// Stop the flusher and flush what is left
    pub(crate) async fn shutdown(&self) -> usize {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("write-back flusher panicked: {}", e);
            }
        }
        self.buffer.flush().await
    }
}

impl<V> Drop for WriteBack<V> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
