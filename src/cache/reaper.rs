//! Background Reaper
//!
//! Periodic task owned by a tier: wakes on a fixed interval, runs the tier's
//! sweep, and stops when the tier closes or is dropped.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct Reaper {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// A reaper that never runs
    pub(crate) fn disabled() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start `sweep` every `interval`. A zero interval, or no Tokio runtime,
    /// leaves the reaper disabled and expiry purely lazy.
    pub(crate) fn spawn<F, Fut>(tier: &'static str, interval: Duration, sweep: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Self::disabled();
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(tier, "no Tokio runtime, background cleanup disabled");
                return Self::disabled();
            }
        };

        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => sweep().await,
                }
            }
            debug!(tier, "reaper stopped");
        });

        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task and wait for it to finish. Safe to call repeatedly.
    pub(crate) async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("reaper task panicked: {}", e);
                }
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reaper_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let reaper = Reaper::spawn("test", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(reaper.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        reaper.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several sweeps, got {}", seen);
        assert!(!reaper.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);

        // Second stop is a no-op
        reaper.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_disabled() {
        let reaper = Reaper::spawn("test", Duration::ZERO, || async {});
        assert!(!reaper.is_running());
        reaper.stop().await;
    }

    #[test]
    fn test_no_runtime_is_disabled() {
        let reaper = Reaper::spawn("test", Duration::from_millis(5), || async {});
        assert!(!reaper.is_running());
    }
}
