//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::cancel::{CancelToken, ReadConn};
use super::models::*;

/// Fixed-width UTC format; lexical order matches time order.
const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of read-only connections opened by `Store::new`.
pub const DEFAULT_READ_CONNECTIONS: usize = 4;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid report: {0}")]
    Validation(String),
    #[error("Serialization error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Background task failed: {0}")]
    Task(String),
    #[error("Read cancelled")]
    Cancelled,
}

/// Thread-safe database store.
///
/// Writes go through a single connection; reads are spread over a small
/// pool of query-only connections so they run alongside ingest under WAL.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
    skipped_rows: Arc<AtomicU64>,
    cancel: Option<CancelToken>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::open(path, DEFAULT_READ_CONNECTIONS)
    }

    /// Open the database, create the schema and start `read_connections`
    /// reader connections. `:memory:` always uses the writer for reads.
    pub fn open<P: AsRef<Path>>(path: P, read_connections: usize) -> Result<Self, DbError> {
        let path = path.as_ref();
        let in_memory = path == Path::new(":memory:");

        let conn = open_connection(path)?;
        let store = Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
            skipped_rows: Arc::new(AtomicU64::new(0)),
            cancel: None,
        };
        store.ensure_schema()?;

        if in_memory || read_connections == 0 {
            return Ok(store);
        }

        let readers = (0..read_connections)
            .map(|_| open_reader(path).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            readers: Arc::new(readers),
            ..store
        })
    }

    /// Create the tables and index if they do not exist yet.
    pub fn ensure_schema(&self) -> Result<(), DbError> {
        let conn = self.writer()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))?;
        Ok(())
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.writer.lock().map_err(|_| DbError::Poisoned)
    }

    /// A handle sharing this store's connections whose reads are
    /// interrupted when `token` is cancelled.
    pub fn with_cancel(&self, token: &CancelToken) -> Store {
        Store {
            cancel: Some(token.clone()),
            ..self.clone()
        }
    }

    /// Borrow a read connection, preferring one that is idle.
    pub(crate) fn reader(&self) -> Result<ReadConn<'_>, DbError> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(DbError::Cancelled);
            }
        }
        ReadConn::new(self.reader_guard()?, self.cancel.as_ref())
    }

    fn reader_guard(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        let count = self.readers.len();
        if count == 0 {
            return self.writer();
        }

        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % count;
        for i in 0..count {
            if let Ok(guard) = self.readers[(start + i) % count].try_lock() {
                return Ok(guard);
            }
        }
        self.readers[start].lock().map_err(|_| DbError::Poisoned)
    }

    /// Number of stored payloads that could not be decoded since startup.
    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows.load(Ordering::Relaxed)
    }

    /// Decode a stored payload, counting and logging rows that fail.
    pub(crate) fn decode_report(&self, payload: &str, client_id: &str) -> Option<Report> {
        match serde_json::from_str(payload) {
            Ok(report) => Some(report),
            Err(e) => {
                self.skipped_rows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Skipping undecodable payload for client {}: {}", client_id, e);
                None
            }
        }
    }

    // --- Ingest ---

    /// Persist a report using the current time as ingest time.
    pub fn submit_report(&self, report: &Report) -> Result<(), DbError> {
        self.submit_report_at(report, Utc::now())
    }

    /// Upsert the client row and append a history row in one transaction.
    ///
    /// Both rows carry `received_at`, so `clients.last_seen` always equals
    /// the timestamp of the history row written by the same call.
    pub fn submit_report_at(&self, report: &Report, received_at: DateTime<Utc>) -> Result<(), DbError> {
        report.validate().map_err(DbError::Validation)?;

        let payload = serde_json::to_string(report)?;
        let time = format_db_time(received_at);

        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO clients (id, name, target_url, last_seen, last_data)
             VALUES (?1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
             name=excluded.name, target_url=excluded.target_url,
             last_seen=excluded.last_seen, last_data=excluded.last_data",
            params![report.client_id, report.target_url, time, payload],
        )?;

        tx.execute(
            "INSERT INTO client_history (client_id, timestamp, success, latency, status_code, error_type, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.client_id,
                time,
                report.is_success(),
                report.timing_metrics.total_response_ms,
                report.response_details.status_code,
                report.error_type(),
                payload,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    // --- Clients ---

    /// List all known clients ordered by name.
    pub fn list_clients(&self) -> Result<Vec<ClientSummary>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT id, name, target_url FROM clients ORDER BY name, id")?;

        let clients = stmt
            .query_map([], |row| {
                Ok(ClientSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    target_url: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(clients)
    }

    /// Get a client row by identifier.
    pub fn get_client(&self, id: &str) -> Result<Option<Client>, DbError> {
        let conn = self.reader()?;
        let client = conn
            .query_row(
                "SELECT id, name, target_url, last_seen, last_data FROM clients WHERE id = ?1",
                params![id],
                |row| {
                    let last_seen: String = row.get(3)?;
                    Ok(Client {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        target_url: row.get(2)?,
                        last_seen: parse_db_time(&last_seen).unwrap_or_default(),
                        last_data: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(client)
    }

    // --- Retention ---

    /// Delete history rows older than `cutoff`. Client rows are untouched.
    pub fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.writer()?;
        let deleted = conn.execute(
            "DELETE FROM client_history WHERE timestamp < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Total number of history rows.
    pub fn history_count(&self) -> Result<i64, DbError> {
        let conn = self.reader()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM client_history", [], |r| r.get(0))?)
    }
}

fn open_connection(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA query_only = ON;")?;
    Ok(conn)
}

/// Format a timestamp for storage.
pub(crate) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Start of a trailing window ending at `now`.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
