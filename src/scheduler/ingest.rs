//! Bounded ingest queue in front of the store writer.
//!
//! `IngestQueue::submit` resolves only after the report has been committed,
//! and fails fast with `IngestError::Overloaded` when the queue is full.

use crate::db::{DbError, Report, Store};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("ingest queue is full")]
    Overloaded,
    #[error("ingest writer has stopped")]
    Closed,
    #[error(transparent)]
    Store(#[from] DbError),
}

struct IngestJob {
    report: Report,
    received_at: DateTime<Utc>,
    done: oneshot::Sender<Result<(), DbError>>,
}

/// Handle used by producers; clone freely.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    /// Spawn the writer task. It exits once every queue handle is dropped
    /// and the remaining jobs are written.
    pub fn start(store: Arc<Store>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_ingest_writer(rx, store));
        (Self { tx }, handle)
    }

    /// Queue a report and wait until it is durably stored.
    pub async fn submit(&self, report: Report) -> Result<(), IngestError> {
        let received_at = Utc::now();
        report.validate().map_err(DbError::Validation)?;

        let (done, wait) = oneshot::channel();
        let job = IngestJob {
            report,
            received_at,
            done,
        };

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })?;

        wait.await.map_err(|_| IngestError::Closed)??;
        Ok(())
    }
}

async fn run_ingest_writer(mut rx: mpsc::Receiver<IngestJob>, store: Arc<Store>) {
    while let Some(job) = rx.recv().await {
        let IngestJob {
            report,
            received_at,
            done,
        } = job;

        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let result = store.submit_report_at(&report, received_at);
            (report, result)
        })
        .await;

        let result = match result {
            Ok((report, result)) => {
                log_report(&report, &result);
                result
            }
            Err(e) => Err(DbError::Task(e.to_string())),
        };

        // The producer may have given up waiting.
        let _ = done.send(result);
    }

    tracing::debug!("Ingest writer stopped");
}

fn log_report(report: &Report, result: &Result<(), DbError>) {
    match result {
        Err(e) => {
            tracing::error!("Failed to store report from {}: {}", report.client_id, e);
        }
        Ok(()) if report.error_details.has_error => {
            tracing::info!(
                "✗ {} - error: {}",
                report.client_id,
                report.error_details.error_type
            );
        }
        Ok(()) => {
            tracing::info!(
                "✓ {} - {}ms (status: {})",
                report.client_id,
                report.timing_metrics.total_response_ms as i64,
                report.response_details.status_code
            );
        }
    }
}
