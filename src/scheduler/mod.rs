//! Background workers: the ingest writer and the retention sweeper.

mod ingest;
mod retention;

pub use ingest::*;
pub use retention::*;

use crate::config::ServerConfig;
use crate::db::Store;

use std::sync::Arc;
use tokio::task::JoinHandle;

/// Owns the background tasks started at process initialization.
pub struct Scheduler {
    ingest: IngestQueue,
    ingest_task: JoinHandle<()>,
    retention_manager: RetentionManager,
    retention_task: JoinHandle<()>,
}

impl Scheduler {
    /// Start the ingest writer and the retention sweeper.
    pub fn start(store: Arc<Store>, cfg: &ServerConfig) -> Self {
        let (ingest, ingest_task) = IngestQueue::start(store.clone(), cfg.ingest_queue_capacity);

        let retention_manager = RetentionManager::new(store, cfg.retention, cfg.sweep_interval);
        let retention_task = retention_manager.start();

        tracing::info!(
            "Scheduler started (retention {}, sweep every {})",
            humantime::format_duration(cfg.retention),
            humantime::format_duration(cfg.sweep_interval)
        );

        Self {
            ingest,
            ingest_task,
            retention_manager,
            retention_task,
        }
    }

    /// Producer handle for the ingest queue.
    pub fn ingest(&self) -> IngestQueue {
        self.ingest.clone()
    }

    /// Stop the sweeper and drain the ingest queue. Reports still queued
    /// are written before this returns, provided every other `IngestQueue`
    /// handle has been dropped.
    pub async fn shutdown(self) {
        self.retention_manager.stop();
        if let Err(e) = self.retention_task.await {
            tracing::error!("Retention task ended abnormally: {}", e);
        }

        drop(self.ingest);
        if let Err(e) = self.ingest_task.await {
            tracing::error!("Ingest writer ended abnormally: {}", e);
        }

        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{report, temp_store};
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_ingest_and_shutdown() {
        let (_tmp, store) = temp_store();
        let store = Arc::new(store);
        let scheduler = Scheduler::start(store.clone(), &ServerConfig::default());

        let queue = scheduler.ingest();
        queue.submit(report("agent-1", 5.0, 200, None)).await.unwrap();
        drop(queue);

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("scheduler did not shut down");

        assert_eq!(store.history_count().unwrap(), 1);
    }
}
