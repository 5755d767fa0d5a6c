//! Configuration module for probetrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "monitor.db")
    pub db_path: String,
    /// Maximum age of history rows before the sweeper removes them (default: 7 days)
    pub retention: Duration,
    /// Time between retention sweeps (default: 1 hour)
    pub sweep_interval: Duration,
    /// A client is online while its last report is younger than this (default: 60s)
    pub online_threshold: Duration,
    /// Deadline for a single read issued by the HTTP layer (default: 30s)
    pub query_timeout: Duration,
    /// Reports that may wait for the writer before ingest is refused (default: 1000)
    pub ingest_queue_capacity: usize,
    /// Read-only SQLite connections (default: 4)
    pub read_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "monitor.db".to_string(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            online_threshold: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            ingest_queue_capacity: 1000,
            read_connections: 4,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PROBETRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PROBETRAIL_DB_PATH`: Database file path (default: "monitor.db")
    /// - `PROBETRAIL_RETENTION`: History retention, e.g. "7days"
    /// - `PROBETRAIL_SWEEP_INTERVAL`: Retention sweep cadence, e.g. "1h"
    /// - `PROBETRAIL_ONLINE_THRESHOLD`: Online window, e.g. "60s"
    /// - `PROBETRAIL_QUERY_TIMEOUT`: Read deadline, e.g. "30s"
    /// - `PROBETRAIL_INGEST_QUEUE`: Ingest queue capacity
    /// - `PROBETRAIL_READ_CONNECTIONS`: Reader pool size
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_number(&lookup, "PROBETRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("PROBETRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(d) = parse_duration(&lookup, "PROBETRAIL_RETENTION") {
            cfg.retention = d;
        }
        if let Some(d) = parse_duration(&lookup, "PROBETRAIL_SWEEP_INTERVAL") {
            cfg.sweep_interval = d;
        }
        if let Some(d) = parse_duration(&lookup, "PROBETRAIL_ONLINE_THRESHOLD") {
            cfg.online_threshold = d;
        }
        if let Some(d) = parse_duration(&lookup, "PROBETRAIL_QUERY_TIMEOUT") {
            cfg.query_timeout = d;
        }

        if let Some(n) = parse_number::<usize, _>(&lookup, "PROBETRAIL_INGEST_QUEUE") {
            cfg.ingest_queue_capacity = n.max(1);
        }
        if let Some(n) = parse_number(&lookup, "PROBETRAIL_READ_CONNECTIONS") {
            cfg.read_connections = n;
        }

        cfg
    }
}

fn parse_number<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}, keeping default", key, raw);
            None
        }
    }
}

fn parse_duration<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match humantime::parse_duration(raw.trim()) {
        Ok(d) if !d.is_zero() => Some(d),
        _ => {
            tracing::warn!("Ignoring invalid {}={:?}, keeping default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "monitor.db");
        assert_eq!(cfg.retention, Duration::from_secs(604_800));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(3600));
        assert_eq!(cfg.online_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let cfg = from_pairs(&[
            ("PROBETRAIL_HTTP_PORT", "9090"),
            ("PROBETRAIL_DB_PATH", "/tmp/probes.db"),
            ("PROBETRAIL_RETENTION", "3days"),
            ("PROBETRAIL_SWEEP_INTERVAL", "15m"),
            ("PROBETRAIL_ONLINE_THRESHOLD", "90s"),
            ("PROBETRAIL_INGEST_QUEUE", "0"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/tmp/probes.db");
        assert_eq!(cfg.retention, Duration::from_secs(3 * 86_400));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(900));
        assert_eq!(cfg.online_threshold, Duration::from_secs(90));
        assert_eq!(cfg.ingest_queue_capacity, 1);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = from_pairs(&[
            ("PROBETRAIL_HTTP_PORT", "not-a-port"),
            ("PROBETRAIL_RETENTION", "forever"),
            ("PROBETRAIL_ONLINE_THRESHOLD", "0s"),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.retention, Duration::from_secs(604_800));
        assert_eq!(cfg.online_threshold, Duration::from_secs(60));
    }
}
