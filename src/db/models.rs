//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Agents send `null` for maps they never filled in.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timing breakdown of one probe, all values in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingMetrics {
    pub dns_lookup_ms: f64,
    pub tcp_connect_ms: f64,
    pub tls_handshake_ms: f64,
    pub request_sent_ms: f64,
    pub first_byte_ms: f64,
    pub total_response_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseDetails {
    pub status_code: i64,
    pub status_text: String,
    #[serde(deserialize_with = "null_as_default")]
    pub headers_received: HashMap<String, String>,
    pub body_size: i64,
    pub body_preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfo {
    pub local_ip: String,
    pub remote_ip: String,
    pub connection_reused: bool,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetails {
    pub has_error: bool,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: i64,
}

/// One probe result as submitted by an agent.
///
/// The same JSON shape is received on the wire, cached per client and
/// stored per history row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Report {
    pub client_id: String,
    /// ISO 8601 time reported by the agent.
    pub timestamp: String,
    pub target_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub request_details: HashMap<String, String>,
    pub timing_metrics: TimingMetrics,
    pub response_details: ResponseDetails,
    pub network_info: NetworkInfo,
    pub error_details: ErrorDetails,
}

impl Report {
    /// Check the fields the store relies on before anything is written.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("client_id must not be empty".to_string());
        }

        let t = &self.timing_metrics;
        let timings = [
            ("dns_lookup_ms", t.dns_lookup_ms),
            ("tcp_connect_ms", t.tcp_connect_ms),
            ("tls_handshake_ms", t.tls_handshake_ms),
            ("request_sent_ms", t.request_sent_ms),
            ("first_byte_ms", t.first_byte_ms),
            ("total_response_ms", t.total_response_ms),
        ];
        for (name, value) in timings {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number", name));
            }
        }

        if self.response_details.body_size < 0 {
            return Err("body_size must not be negative".to_string());
        }
        if self.error_details.retry_count < 0 {
            return Err("retry_count must not be negative".to_string());
        }

        Ok(())
    }

    /// Whether the probe succeeded.
    pub fn is_success(&self) -> bool {
        !self.error_details.has_error
    }

    /// Error classification stored with the history row (empty on success).
    pub fn error_type(&self) -> &str {
        if self.error_details.has_error {
            &self.error_details.error_type
        } else {
            ""
        }
    }
}

/// A reporting agent as persisted in the `clients` table.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub target_url: String,
    pub last_seen: DateTime<Utc>,
    pub last_data: String,
}

/// Identity fields returned by `Store::list_clients`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    pub target_url: String,
}

/// Most recent failure on record for a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub error_type: String,
    pub time: DateTime<Utc>,
}

/// Success/total counts over the success-rate window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuccessCounts {
    pub successes: i64,
    pub total: i64,
}

impl SuccessCounts {
    /// Success percentage, or `None` when there is nothing in the window.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.successes as f64 / self.total as f64 * 100.0)
        }
    }
}

/// Derived per-client view, computed at read time and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: String,
    pub name: String,
    pub target_url: String,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    pub last_latency: f64,
    pub last_status_code: i64,
    /// 0.0 when `checks_in_window` is 0.
    pub success_rate: f64,
    pub checks_in_window: i64,
    pub last_error: String,
    pub last_error_time: Option<DateTime<Utc>>,
    pub timing_breakdown: TimingMetrics,
    pub network_info: NetworkInfo,
}

/// Fleet-wide counters shown above the client list.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub online_count: usize,
    pub offline_count: usize,
    pub total_count: usize,
    pub average_latency: f64,
    pub clients: Vec<ClientStatus>,
}

impl DashboardSummary {
    /// Build the summary, ordering clients online-first then by name.
    pub fn from_statuses(mut clients: Vec<ClientStatus>) -> Self {
        clients.sort_by(|a, b| {
            b.is_online
                .cmp(&a.is_online)
                .then_with(|| a.name.cmp(&b.name))
        });

        let online_count = clients.iter().filter(|c| c.is_online).count();
        let latencies: Vec<f64> = clients
            .iter()
            .map(|c| c.last_latency)
            .filter(|l| *l > 0.0)
            .collect();
        let average_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        Self {
            online_count,
            offline_count: clients.len() - online_count,
            total_count: clients.len(),
            average_latency,
            clients,
        }
    }
}

/// Which history rows to keep by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Success,
    Error,
}

impl StatusFilter {
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => StatusFilter::Success,
            "error" => StatusFilter::Error,
            _ => StatusFilter::All,
        }
    }
}

/// Closed set of sortable history columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortColumn {
    #[default]
    Timestamp,
    Latency,
    StatusCode,
    ErrorType,
}

impl SortColumn {
    /// Unrecognized tokens fall back to `Timestamp`.
    pub fn parse(s: &str) -> Self {
        match s {
            "latency" => SortColumn::Latency,
            "status_code" => SortColumn::StatusCode,
            "error_type" => SortColumn::ErrorType,
            _ => SortColumn::Timestamp,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            SortColumn::Timestamp => "timestamp",
            SortColumn::Latency => "latency",
            SortColumn::StatusCode => "status_code",
            SortColumn::ErrorType => "error_type",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Anything other than `desc` is ascending.
    pub fn parse(s: &str) -> Self {
        if s == "desc" {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Options for `Store::get_filtered_history`.
#[derive(Debug, Clone)]
pub struct HistoryFilterOptions {
    pub client_id: String,
    pub duration: Duration,
    pub status_filter: StatusFilter,
    /// Inclusive lower bound in ms; 0 means unset.
    pub min_latency: f64,
    /// Inclusive upper bound in ms; 0 means unset.
    pub max_latency: f64,
    pub sort_by: SortColumn,
    pub sort_order: SortOrder,
    /// 0 means unbounded.
    pub limit: usize,
}

impl HistoryFilterOptions {
    pub fn new(client_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            duration,
            status_filter: StatusFilter::All,
            min_latency: 0.0,
            max_latency: 0.0,
            sort_by: SortColumn::Timestamp,
            sort_order: SortOrder::Asc,
            limit: 0,
        }
    }
}
