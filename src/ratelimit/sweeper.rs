//! Background removal of expired counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::counter::CounterStore;
use crate::task::TaskHandle;

/// Lower bound on the sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically removes counters whose window has closed.
///
/// Sweeping only ever deletes expired entries, so it is safe to run at any
/// time alongside request traffic; a sweep that races a fresh hit on the same
/// key at worst drops a window that the hit would have replaced anyway.
pub struct ExpirySweeper {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper. Intervals below one second are raised to one second.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    /// Sweep interval in effect.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single sweep. Returns how many counters were removed.
    pub async fn sweep_once(&self) -> usize {
        match self.store.sweep(self.clock.now()).await {
            Ok(removed) => {
                debug!(removed, remaining = self.store.len(), "Expired counters swept");
                removed
            }
            Err(e) => {
                warn!(error = %e, "Counter sweep failed");
                0
            }
        }
    }

    /// Start sweeping on a background task.
    pub fn spawn(self) -> TaskHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Expiry sweeper started"
        );

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing has expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Expiry sweeper stopped");
                        break;
                    }
                }
            }
        });

        TaskHandle::new("expiry-sweeper", shutdown_tx, join)
    }
}
