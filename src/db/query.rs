//! History queries: time windows, filters and whitelisted ordering.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Result as SqlResult};
use std::time::Duration;

use super::models::*;
use super::store::{format_db_time, window_start, DbError, Store};

/// A parameterised history query. Only fixed fragments and the
/// `SortColumn`/`SortOrder` keywords ever reach the SQL text.
#[derive(Debug)]
pub(crate) struct HistoryQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl HistoryQuery {
    fn new(client_id: &str, since: DateTime<Utc>) -> Self {
        Self {
            sql: "SELECT data FROM client_history WHERE client_id = ? AND timestamp > ?".to_string(),
            params: vec![
                Value::Text(client_id.to_string()),
                Value::Text(format_db_time(since)),
            ],
        }
    }

    fn and(&mut self, clause: &str, value: Option<Value>) {
        self.sql.push_str(" AND ");
        self.sql.push_str(clause);
        if let Some(v) = value {
            self.params.push(v);
        }
    }

    fn order_by(&mut self, column: SortColumn, order: SortOrder) {
        let dir = order.keyword();
        self.sql
            .push_str(&format!(" ORDER BY {} {}, id {}", column.column(), dir, dir));
    }

    fn limit(&mut self, limit: usize) {
        if limit > 0 {
            self.sql.push_str(" LIMIT ?");
            self.params.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
        }
    }
}

/// Build the query behind `get_filtered_history`.
pub(crate) fn build_filtered_query(opts: &HistoryFilterOptions, now: DateTime<Utc>) -> HistoryQuery {
    let mut q = HistoryQuery::new(&opts.client_id, window_start(now, opts.duration));

    match opts.status_filter {
        StatusFilter::All => {}
        StatusFilter::Success => q.and("success = 1", None),
        StatusFilter::Error => q.and("success = 0", None),
    }

    if opts.min_latency > 0.0 {
        q.and("latency >= ?", Some(Value::Real(opts.min_latency)));
    }
    if opts.max_latency > 0.0 {
        q.and("latency <= ?", Some(Value::Real(opts.max_latency)));
    }

    q.order_by(opts.sort_by, opts.sort_order);
    q.limit(opts.limit);
    q
}

/// Build the query behind `get_anomalies`.
pub(crate) fn build_anomaly_query(
    client_id: &str,
    threshold_ms: f64,
    duration: Duration,
    limit: usize,
    now: DateTime<Utc>,
) -> HistoryQuery {
    let mut q = HistoryQuery::new(client_id, window_start(now, duration));
    q.and("(success = 0 OR latency > ?)", Some(Value::Real(threshold_ms)));
    q.order_by(SortColumn::Timestamp, SortOrder::Desc);
    q.limit(limit);
    q
}

impl Store {
    /// All reports for a client newer than `now - duration`, oldest first.
    pub fn get_history(&self, client_id: &str, duration: Duration) -> Result<Vec<Report>, DbError> {
        let mut q = HistoryQuery::new(client_id, window_start(Utc::now(), duration));
        q.order_by(SortColumn::Timestamp, SortOrder::Asc);
        self.fetch_reports(&q, client_id)
    }

    /// Reports for a client matching the status and latency filters,
    /// ordered by a whitelisted column and optionally truncated.
    pub fn get_filtered_history(&self, opts: &HistoryFilterOptions) -> Result<Vec<Report>, DbError> {
        let q = build_filtered_query(opts, Utc::now());
        self.fetch_reports(&q, &opts.client_id)
    }

    /// Failed reports or reports slower than `threshold_ms`, newest first.
    pub fn get_anomalies(
        &self,
        client_id: &str,
        threshold_ms: f64,
        duration: Duration,
        limit: usize,
    ) -> Result<Vec<Report>, DbError> {
        let q = build_anomaly_query(client_id, threshold_ms, duration, limit, Utc::now());
        self.fetch_reports(&q, client_id)
    }

    fn fetch_reports(&self, q: &HistoryQuery, client_id: &str) -> Result<Vec<Report>, DbError> {
        let payloads = {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(&q.sql)?;
            let rows = stmt
                .query_map(params_from_iter(q.params.iter()), |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        Ok(payloads
            .iter()
            .filter_map(|p| self.decode_report(p, client_id))
            .collect())
    }
}
