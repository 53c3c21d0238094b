//! Promotion Queue
//!
//! Copies values found in a lower tier into the tiers above it. Jobs go
//! through a bounded channel drained by a fixed pool of workers; when the
//! channel is full the job is dropped and counted, so a burst of lower-tier
//! hits never piles up unbounded background work.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::layered::{bounded, Layer};
use super::metrics::LayeredMetrics;
use super::traits::CacheValue;

/// One value to copy into `targets` (layer indices)
#[derive(Debug)]
pub(crate) struct PromotionJob<V> {
    pub key: String,
    pub value: V,
    pub targets: Vec<usize>,
}

type SharedReceiver<V> = Arc<tokio::sync::Mutex<mpsc::Receiver<PromotionJob<V>>>>;

pub(crate) struct Promoter<V> {
    tx: Mutex<Option<mpsc::Sender<PromotionJob<V>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<LayeredMetrics>,
}

impl<V: CacheValue> Promoter<V> {
    /// Start `workers` tasks on the current runtime
    pub(crate) fn spawn(
        layers: Arc<[Layer<V>]>,
        metrics: Arc<LayeredMetrics>,
        workers: usize,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx: SharedReceiver<V> = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    rx.clone(),
                    layers.clone(),
                    metrics.clone(),
                    timeout,
                ))
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            metrics,
        }
    }

    /// Queue a job without waiting
    pub(crate) fn submit(&self, job: PromotionJob<V>) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            self.metrics.record_promotion_dropped();
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                self.metrics.record_promotion_dropped();
                debug!(key = %job.key, "promotion queue full, dropping");
            }
            Err(TrySendError::Closed(job)) => {
                self.metrics.record_promotion_dropped();
                debug!(key = %job.key, "promotion queue closed, dropping");
            }
        }
    }

    /// Close the queue, let workers drain it, and wait for them
    pub(crate) async fn shutdown(&self) {
        let sender = self.tx.lock().take();
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("promotion worker panicked: {}", e);
            }
        }
    }
}

async fn run_worker<V: CacheValue>(
    id: usize,
    rx: SharedReceiver<V>,
    layers: Arc<[Layer<V>]>,
    metrics: Arc<LayeredMetrics>,
    timeout: Option<Duration>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        for &index in &job.targets {
            let Some(layer) = layers.get(index).filter(|l| l.is_enabled()) else {
                continue;
            };
            // Promoted copies take the target tier's default TTL
            let write = layer.cache.set(&job.key, job.value.clone(), Duration::ZERO);
            match bounded(timeout, "promote", write).await {
                Ok(()) => {
                    metrics.record_promotion();
                    debug!(key = %job.key, layer = layer.name(), "promoted");
                }
                Err(e) => {
                    metrics.record_promotion_failed();
                    warn!(key = %job.key, layer = layer.name(), "promotion failed: {}", e);
                }
            }
        }
    }
    debug!(worker = id, "promotion worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
