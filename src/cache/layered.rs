//! Layered Cache - Ordered Composite of Tiers
//!
//! Presents an ordered list of tiers (index 0 fastest) behind the same
//! [`Cache`] contract.
//!
//! # Read path
//!
//! Enabled tiers are asked in order and the first hit wins. A miss moves on
//! to the next tier; any other error stops the cascade and is returned. A hit
//! below tier 0 is queued for promotion into the enabled tiers above it.
//!
//! # Write path
//!
//! - write-through: every enabled tier is written, the first error is returned
//! - write-back: the first enabled tier is written, lower tiers are updated by
//!   the background flusher
//! - neither: only the first enabled tier is written
//!
//! `delete` and `clear` reach every tier, enabled or not.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::disk::DiskCache;
use super::memory::MemoryCache;
use super::metrics::{LatencyTracker, LayeredMetrics, MetricsSnapshot};
use super::promotion::{Promoter, PromotionJob};
use super::remote::{MockRemoteCache, RemoteCache};
use super::traits::{Cache, CacheStats, CacheValue};
use super::writeback::WriteBack;
use crate::config::{LayerKind, LayeredCacheConfig};
use crate::error::{CacheError, Result};

/// Run `fut`, failing with [`CacheError::Timeout`] after `timeout`
pub(crate) async fn bounded<T, F>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| CacheError::Timeout { operation, after })?,
        None => fut.await,
    }
}

/// One tier inside the composite
pub(crate) struct Layer<V> {
    pub(crate) cache: Arc<dyn Cache<V>>,
    enabled: AtomicBool,
    name: String,
}

impl<V: CacheValue> Layer<V> {
    pub(crate) fn new(cache: Arc<dyn Cache<V>>) -> Self {
        let name = cache.name().to_string();
        Self {
            cache,
            enabled: AtomicBool::new(true),
            name,
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Composite behaviour knobs
#[derive(Debug, Clone)]
pub struct LayeredOptions {
    /// Copy lower-tier hits into the tiers above
    pub promote_enabled: bool,
    /// Write every enabled tier on `set`
    pub write_through: bool,
    /// Write the first tier, propagate later (ignored with write-through)
    pub write_back: bool,
    /// Flusher period (zero: flush on threshold only)
    pub write_back_interval: Duration,
    /// Buffered entries that trigger an early flush (0: interval only)
    pub write_back_threshold: usize,
    /// Bound on every tier call
    pub operation_timeout: Option<Duration>,
    pub promotion_workers: usize,
    pub promotion_queue_capacity: usize,
}

impl Default for LayeredOptions {
    fn default() -> Self {
        Self {
            promote_enabled: true,
            write_through: false,
            write_back: false,
            write_back_interval: Duration::from_secs(5),
            write_back_threshold: 100,
            operation_timeout: None,
            promotion_workers: 4,
            promotion_queue_capacity: 1024,
        }
    }
}

/// Stats of one tier as seen by the composite
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub name: String,
    pub enabled: bool,
    pub stats: CacheStats,
}

/// Per-tier stats plus composite counters
#[derive(Debug, Clone)]
pub struct LayeredStats {
    pub layers: Vec<LayerReport>,
    pub metrics: MetricsSnapshot,
    /// Entries waiting for the write-back flusher
    pub pending_write_back: usize,
}

/// Ordered composite of cache tiers
pub struct LayeredCache<V: CacheValue> {
    layers: Arc<[Layer<V>]>,
    options: LayeredOptions,
    metrics: Arc<LayeredMetrics>,
    promoter: Option<Promoter<V>>,
    write_back: Option<WriteBack<V>>,
    closed: AtomicBool,
}

impl<V: CacheValue> std::fmt::Debug for LayeredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache").finish_non_exhaustive()
    }
}

impl<V: CacheValue> LayeredCache<V> {
    /// Compose `tiers`, fastest first. Must run inside a Tokio runtime when
    /// promotion or write-back is enabled.
    pub fn new(tiers: Vec<Arc<dyn Cache<V>>>, options: LayeredOptions) -> Result<Self> {
        if tiers.is_empty() {
            return Err(CacheError::Config(
                "layered cache needs at least one layer".to_string(),
            ));
        }
        let needs_tasks = options.promote_enabled || options.write_back;
        if needs_tasks && tokio::runtime::Handle::try_current().is_err() {
            return Err(CacheError::Config(
                "layered cache must be created inside a Tokio runtime".to_string(),
            ));
        }
        if options.write_through && options.write_back {
            warn!("write_through and write_back both set, using write_through");
        }

        let layers: Arc<[Layer<V>]> = tiers.into_iter().map(Layer::new).collect();
        let metrics = Arc::new(LayeredMetrics::new());

        let promoter = options.promote_enabled.then(|| {
            Promoter::spawn(
                layers.clone(),
                metrics.clone(),
                options.promotion_workers,
                options.promotion_queue_capacity,
                options.operation_timeout,
            )
        });
        let write_back = (options.write_back && !options.write_through).then(|| {
            WriteBack::spawn(
                layers.clone(),
                metrics.clone(),
                options.write_back_interval,
                options.write_back_threshold,
                options.operation_timeout,
            )
        });

        info!(
            layers = %layers.iter().map(|l| l.name()).collect::<Vec<_>>().join(" -> "),
            promote = options.promote_enabled,
            write_through = options.write_through,
            write_back = write_back.is_some(),
            "layered cache opened"
        );

        Ok(Self {
            layers,
            options,
            metrics,
            promoter,
            write_back,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn enabled_layers(&self) -> impl Iterator<Item = (usize, &Layer<V>)> + '_ {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.is_enabled())
    }

    /// Number of tiers, enabled or not
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Tier at `index`
    pub fn layer(&self, index: usize) -> Option<&Arc<dyn Cache<V>>> {
        self.layers.get(index).map(|layer| &layer.cache)
    }

    pub fn is_layer_enabled(&self, index: usize) -> bool {
        self.layers.get(index).is_some_and(|l| l.is_enabled())
    }

    /// Include or skip a tier for get, set and promotion
    pub fn set_layer_enabled(&self, index: usize, enabled: bool) -> Result<()> {
        let layer = self.layers.get(index).ok_or_else(|| {
            CacheError::Config(format!(
                "layer index {} out of range ({} layers)",
                index,
                self.layers.len()
            ))
        })?;
        layer.set_enabled(enabled);
        info!(layer = layer.name(), index, enabled, "layer toggled");
        Ok(())
    }

    /// Queue promotion of a value found at `found_at` into the tiers above it
    fn promote(&self, key: &str, value: &V, found_at: usize) {
        let Some(promoter) = &self.promoter else {
            return;
        };
        let targets: Vec<usize> = self
            .enabled_layers()
            .map(|(index, _)| index)
            .take_while(|&index| index < found_at)
            .collect();
        if targets.is_empty() {
            return;
        }
        debug!(key, from = found_at, "queueing promotion");
        promoter.submit(PromotionJob {
            key: key.to_string(),
            value: value.clone(),
            targets,
        });
    }

    /// Write-back value not yet flushed below the first tier
    fn unflushed(&self, key: &str) -> Option<V> {
        self.write_back.as_ref()?.pending_value(key)
    }

    async fn lookup(&self, key: &str) -> Result<V> {
        for (position, (index, layer)) in self.enabled_layers().enumerate() {
            // Lower tiers may still hold an older value
            if position == 1 {
                if let Some(value) = self.unflushed(key) {
                    debug!(key, "hit in write-back buffer");
                    return Ok(value);
                }
            }
            match bounded(self.options.operation_timeout, "get", layer.cache.get(key)).await {
                Ok(value) => {
                    debug!(key, layer = layer.name(), "hit");
                    if index > 0 && self.options.promote_enabled {
                        self.promote(key, &value, index);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_miss() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::miss(key))
    }

    /// Per-tier stats plus composite counters
    pub fn layer_stats(&self) -> LayeredStats {
        LayeredStats {
            layers: self
                .layers
                .iter()
                .map(|layer| LayerReport {
                    name: layer.name().to_string(),
                    enabled: layer.is_enabled(),
                    stats: layer.cache.stats(),
                })
                .collect(),
            metrics: self.metrics.snapshot(),
            pending_write_back: self.write_back.as_ref().map_or(0, |wb| wb.pending()),
        }
    }

    /// Load `data` through the composite; returns entries written
    pub async fn warm(&self, data: HashMap<String, V>, ttl: Duration) -> Result<usize> {
        let total = data.len();
        for (key, value) in data {
            self.set(&key, value, ttl).await?;
        }
        info!(entries = total, "cache warmed");
        Ok(total)
    }

    /// Push buffered write-back entries to the lower tiers now
    pub async fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        match &self.write_back {
            Some(wb) => Ok(wb.flush().await),
            None => Ok(0),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<V> LayeredCache<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Build every tier described by `config`.
    ///
    /// `remote` backs the first `remote` layer; without it a connected
    /// [`MockRemoteCache`] is created.
    pub async fn from_config(
        config: &LayeredCacheConfig,
        remote: Option<Arc<dyn Cache<V>>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut remote = remote;
        let mut tiers: Vec<Arc<dyn Cache<V>>> = Vec::with_capacity(config.layers.len());
        for layer in &config.layers {
            let tier: Arc<dyn Cache<V>> = match layer.kind {
                LayerKind::Memory => Arc::new(MemoryCache::<V>::new(layer.memory_config()?)),
                LayerKind::Disk => Arc::new(DiskCache::<V>::open(layer.disk_config()?).await?),
                LayerKind::Remote => match remote.take() {
                    Some(injected) => injected,
                    None => {
                        let mock = MockRemoteCache::<V>::new(layer.remote_config()?);
                        mock.connect().await?;
                        Arc::new(mock)
                    }
                },
            };
            tiers.push(tier);
        }

        let cache = Self::new(tiers, config.options()?)?;
        for (index, layer) in config.layers.iter().enumerate() {
            if !layer.enabled {
                cache.set_layer_enabled(index, false)?;
            }
        }
        Ok(cache)
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for LayeredCache<V> {
    fn name(&self) -> &str {
        "layered"
    }

    async fn get(&self, key: &str) -> Result<V> {
        self.ensure_open()?;
        let tracker = LatencyTracker::start();
        let result = self.lookup(key).await;
        self.metrics.record_get_latency(tracker.elapsed());

        match &result {
            Ok(_) => self.metrics.record_hit(),
            Err(e) if e.is_miss() => self.metrics.record_miss(),
            Err(_) => {}
        }
        result
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        self.metrics.record_set();
        let timeout = self.options.operation_timeout;

        if self.options.write_through {
            let mut first_error = None;
            for (_, layer) in self.enabled_layers() {
                let write = layer.cache.set(key, value.clone(), ttl);
                if let Err(e) = bounded(timeout, "set", write).await {
                    warn!(key, layer = layer.name(), "write-through failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            return match first_error {
                Some(e) => Err(e),
                None => {
                    self.metrics.record_write_through();
                    Ok(())
                }
            };
        }

        let (_, first) = self
            .enabled_layers()
            .next()
            .ok_or_else(|| CacheError::Config("no enabled cache layers".to_string()))?;
        bounded(timeout, "set", first.cache.set(key, value.clone(), ttl)).await?;

        if let Some(wb) = &self.write_back {
            wb.record(key, value, ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(wb) = &self.write_back {
            wb.discard(key);
        }

        let mut last_error = None;
        for layer in self.layers.iter() {
            let op = layer.cache.delete(key);
            if let Err(e) = bounded(self.options.operation_timeout, "delete", op).await {
                warn!(key, layer = layer.name(), "delete failed: {}", e);
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        if let Some(wb) = &self.write_back {
            wb.discard_all();
        }

        let mut last_error = None;
        for layer in self.layers.iter() {
            let op = layer.cache.clear();
            if let Err(e) = bounded(self.options.operation_timeout, "clear", op).await {
                warn!(layer = layer.name(), "clear failed: {}", e);
                last_error = Some(e);
            }
        }
        self.metrics.reset_lookups();
        last_error.map_or(Ok(()), Err)
    }

    fn stats(&self) -> CacheStats {
        let mut total = CacheStats {
            hit_count: self.metrics.hits(),
            miss_count: self.metrics.misses(),
            ..Default::default()
        };
        for (index, layer) in self.layers.iter().enumerate() {
            let stats = layer.cache.stats();
            total.size += stats.size;
            total.max_size += stats.max_size;
            if index == 0 {
                total.ttl = stats.ttl;
            }
            total.last_cleanup = total.last_cleanup.max(stats.last_cleanup);
        }
        total
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(wb) = &self.write_back {
            let flushed = wb.shutdown().await;
            debug!(flushed, "final write-back flush");
        }
        if let Some(promoter) = &self.promoter {
            promoter.shutdown().await;
        }

        // Tiers are independent, close them together
        let results = join_all(self.layers.iter().map(|layer| layer.cache.close())).await;
        let mut last_error = None;
        for (layer, result) in self.layers.iter().zip(results) {
            if let Err(e) = result {
                warn!(layer = layer.name(), "close failed: {}", e);
                last_error = Some(e);
            }
        }
        info!(metrics = ?self.metrics.snapshot(), "layered cache closed");
        last_error.map_or(Ok(()), Err)
    }

    /// Ask tier by tier for the keys still missing
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, V>> {
        self.ensure_open()?;
        let mut found = HashMap::with_capacity(keys.len());
        let mut remaining: Vec<String> = keys.to_vec();

        for (position, (index, layer)) in self.enabled_layers().enumerate() {
            if position == 1 {
                remaining.retain(|key| match self.unflushed(key) {
                    Some(value) => {
                        found.insert(key.clone(), value);
                        false
                    }
                    None => true,
                });
            }
            if remaining.is_empty() {
                break;
            }
            let lookup = layer.cache.batch_get(&remaining);
            let hits = bounded(self.options.operation_timeout, "batch_get", lookup).await?;
            if index > 0 && self.options.promote_enabled {
                for (key, value) in &hits {
                    self.promote(key, value, index);
                }
            }
            remaining.retain(|key| !hits.contains_key(key));
            found.extend(hits);
        }

        self.metrics.record_hits(found.len() as u64);
        self.metrics.record_misses(remaining.len() as u64);
        Ok(found)
    }
}

// =============================================================================
// Tests
// =============================================================================
