//! Derived client status: online state, success rate and last error.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::time::Duration;

use super::models::*;
use super::store::{format_db_time, parse_db_time, window_start, DbError, Store};

/// Trailing window used for the success rate.
pub const SUCCESS_RATE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// A client is online while its last report is younger than `threshold`.
/// A threshold too large to represent counts as invalid and reports offline.
pub fn is_online(last_seen: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match ChronoDuration::from_std(threshold) {
        Ok(threshold) => now.signed_duration_since(last_seen) < threshold,
        Err(_) => false,
    }
}

fn success_counts(conn: &Connection, client_id: &str, since: DateTime<Utc>) -> Result<SuccessCounts, DbError> {
    let (total, successes) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM client_history
         WHERE client_id = ?1 AND timestamp > ?2",
        params![client_id, format_db_time(since)],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;
    Ok(SuccessCounts { successes, total })
}

fn last_error(conn: &Connection, client_id: &str) -> Result<Option<LastError>, DbError> {
    let row = conn
        .query_row(
            "SELECT error_type, timestamp FROM client_history
             WHERE client_id = ?1 AND success = 0
             ORDER BY timestamp DESC, id DESC LIMIT 1",
            params![client_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    Ok(row.map(|(error_type, time)| LastError {
        error_type,
        time: parse_db_time(&time).unwrap_or_default(),
    }))
}

impl Store {
    /// Success and total counts over the trailing 24 hours.
    pub fn success_counts(&self, client_id: &str) -> Result<SuccessCounts, DbError> {
        let conn = self.reader()?;
        success_counts(&conn, client_id, window_start(Utc::now(), SUCCESS_RATE_WINDOW))
    }

    /// Success percentage over the trailing 24 hours; 0.0 when there is
    /// no data. Use `success_counts` to tell "no data" from "0 %".
    pub fn calculate_success_rate(&self, client_id: &str) -> Result<f64, DbError> {
        Ok(self.success_counts(client_id)?.percent().unwrap_or(0.0))
    }

    /// Most recent failed report for a client, or `None` if there is none.
    pub fn get_last_error(&self, client_id: &str) -> Result<Option<LastError>, DbError> {
        let conn = self.reader()?;
        last_error(&conn, client_id)
    }

    /// Status for every known client, most recently seen first.
    pub fn client_statuses(&self, online_threshold: Duration) -> Result<Vec<ClientStatus>, DbError> {
        self.client_statuses_at(online_threshold, Utc::now())
    }

    pub fn client_statuses_at(
        &self,
        online_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClientStatus>, DbError> {
        let conn = self.reader()?;

        let clients = {
            let mut stmt = conn.prepare(
                "SELECT id, name, target_url, last_seen, last_data FROM clients ORDER BY last_seen DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                let last_seen: String = row.get(3)?;
                Ok(Client {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    target_url: row.get(2)?,
                    last_seen: parse_db_time(&last_seen).unwrap_or_default(),
                    last_data: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let since = window_start(now, SUCCESS_RATE_WINDOW);
        let mut statuses = Vec::with_capacity(clients.len());

        for client in clients {
            // A broken snapshot still yields a row, with zeroed latest fields.
            let last = self
                .decode_report(&client.last_data, &client.id)
                .unwrap_or_default();
            let counts = success_counts(&conn, &client.id, since)?;
            let error = last_error(&conn, &client.id)?;

            statuses.push(ClientStatus {
                is_online: is_online(client.last_seen, now, online_threshold),
                last_latency: last.timing_metrics.total_response_ms,
                last_status_code: last.response_details.status_code,
                success_rate: counts.percent().unwrap_or(0.0),
                checks_in_window: counts.total,
                last_error: error.as_ref().map(|e| e.error_type.clone()).unwrap_or_default(),
                last_error_time: error.map(|e| e.time),
                timing_breakdown: last.timing_metrics,
                network_info: last.network_info,
                id: client.id,
                name: client.name,
                target_url: client.target_url,
                last_seen: client.last_seen,
            });
        }

        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::{report, temp_store};
    use rusqlite::params;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_is_online_boundary() {
        let now = Utc::now();
        assert!(is_online(now - ChronoDuration::seconds(59), now, MINUTE));
        assert!(!is_online(now - ChronoDuration::seconds(60), now, MINUTE));
        assert!(!is_online(now - ChronoDuration::seconds(61), now, MINUTE));
        assert!(is_online(now, now, MINUTE));
    }

    #[test]
    fn test_is_online_unrepresentable_threshold() {
        let now = Utc::now();
        assert!(!is_online(now, now, Duration::MAX));
        assert!(!is_online(now - ChronoDuration::days(365), now, Duration::MAX));
    }

    #[test]
    fn test_success_rate_without_data() {
        let (_tmp, store) = temp_store();
        assert_eq!(store.calculate_success_rate("ghost").unwrap(), 0.0);
        assert_eq!(store.success_counts("ghost").unwrap().percent(), None);
    }

    #[test]
    fn test_success_rate_seventy_percent() {
        let (_tmp, store) = temp_store();
        let now = Utc::now();
        for i in 0..7 {
            store
                .submit_report_at(&report("agent-1", 10.0, 200, None), now - ChronoDuration::minutes(i))
                .unwrap();
        }
        for i in 0..3 {
            store
                .submit_report_at(&report("agent-1", 0.0, 0, Some("timeout")), now - ChronoDuration::minutes(10 + i))
                .unwrap();
        }
        // Outside the 24h window.
        store
            .submit_report_at(&report("agent-1", 0.0, 0, Some("timeout")), now - ChronoDuration::hours(25))
            .unwrap();

        assert_eq!(store.calculate_success_rate("agent-1").unwrap(), 70.0);
        assert_eq!(
            store.success_counts("agent-1").unwrap(),
            SuccessCounts { successes: 7, total: 10 }
        );
    }

    #[test]
    fn test_get_last_error() {
        let (_tmp, store) = temp_store();
        assert_eq!(store.get_last_error("agent-1").unwrap(), None);

        let now = Utc::now();
        let older = now - ChronoDuration::minutes(5);
        let newer = now - ChronoDuration::minutes(2);
        store.submit_report_at(&report("agent-1", 0.0, 0, Some("dns")), older).unwrap();
        store.submit_report_at(&report("agent-1", 0.0, 0, Some("tls")), newer).unwrap();
        store.submit_report_at(&report("agent-1", 12.0, 200, None), now).unwrap();

        let last = store.get_last_error("agent-1").unwrap().unwrap();
        assert_eq!(last.error_type, "tls");
        assert_eq!(last.time, newer);
    }

    #[test]
    fn test_client_statuses_online_and_snapshot() {
        let (_tmp, store) = temp_store();
        let now = Utc::now();

        let mut fresh = report("fresh", 42.0, 204, None);
        fresh.timing_metrics.dns_lookup_ms = 3.0;
        fresh.network_info.protocol_version = "HTTP/2.0".to_string();
        store.submit_report_at(&fresh, now - ChronoDuration::seconds(59)).unwrap();
        store
            .submit_report_at(&report("stale", 10.0, 200, None), now - ChronoDuration::seconds(60))
            .unwrap();

        let statuses = store.client_statuses_at(MINUTE, now).unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "fresh");
        assert!(statuses[0].is_online);
        assert_eq!(statuses[0].last_latency, 42.0);
        assert_eq!(statuses[0].last_status_code, 204);
        assert_eq!(statuses[0].timing_breakdown.dns_lookup_ms, 3.0);
        assert_eq!(statuses[0].network_info.protocol_version, "HTTP/2.0");
        assert_eq!(statuses[0].success_rate, 100.0);
        assert_eq!(statuses[0].checks_in_window, 1);
        assert_eq!(statuses[0].last_error, "");
        assert_eq!(statuses[0].last_error_time, None);

        assert_eq!(statuses[1].id, "stale");
        assert!(!statuses[1].is_online);
    }

    #[test]
    fn test_client_statuses_tolerates_broken_snapshot() {
        let (_tmp, store) = temp_store();
        store.submit_report(&report("agent-1", 42.0, 200, None)).unwrap();
        store
            .execute_raw("UPDATE clients SET last_data = 'garbage' WHERE id = ?1", params!["agent-1"])
            .unwrap();

        let statuses = store.client_statuses(MINUTE).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].last_latency, 0.0);
        assert_eq!(statuses[0].checks_in_window, 1);
        assert_eq!(store.skipped_rows(), 1);
    }
}
