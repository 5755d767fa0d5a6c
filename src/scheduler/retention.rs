//! Retention manager for cleaning up old history.

use crate::db::{DbError, Store};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shortest sweep period accepted; `interval_at` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically deletes history rows older than the retention window.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
    interval: Duration,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    /// Intervals below `MIN_SWEEP_INTERVAL` are raised to it.
    pub fn new(store: Arc<Store>, retention: Duration, interval: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            retention,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            stop,
        }
    }

    /// Start the retention background task. The first sweep runs one
    /// interval after start.
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let retention = self.retention;
        let period = self.interval;
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let result = tokio::task::spawn_blocking(move || sweep_once(&store, retention)).await;
                        match result {
                            Ok(Ok(deleted)) => {
                                tracing::info!("RetentionManager: Removed {} history rows", deleted);
                            }
                            Ok(Err(e)) => {
                                tracing::error!("RetentionManager: Sweep failed: {}", e);
                            }
                            Err(e) => {
                                tracing::error!("RetentionManager: Sweep task panicked: {}", e);
                            }
                        }
                    }
                }
            }

            tracing::debug!("RetentionManager: Stopped");
        })
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// Delete every history row older than `retention`, returning the count.
pub fn sweep_once(store: &Store, retention: Duration) -> Result<usize, DbError> {
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| Utc::now().checked_sub_signed(r));

    match cutoff {
        Some(cutoff) => store.delete_history_before(cutoff),
        None => Ok(0),
    }
}
