//! HTTP request handlers.

use super::{run_blocking, ApiError, AppState};
use crate::db::{
    ClientStatus, DashboardSummary, HistoryFilterOptions, Report, SortColumn, SortOrder, StatusFilter,
};

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_DURATION: Duration = Duration::from_secs(60 * 60);
const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_ANOMALY_THRESHOLD_MS: f64 = 1000.0;
const DEFAULT_ANOMALY_LIMIT: usize = 100;

/// Parse a human duration such as "1h" or "30m", falling back to one hour.
fn parse_duration_or_default(raw: Option<&str>) -> Duration {
    match raw.filter(|s| !s.is_empty()) {
        None => DEFAULT_DURATION,
        Some(s) => match humantime::parse_duration(s) {
            Ok(d) if !d.is_zero() => d,
            _ => {
                tracing::warn!("Invalid duration {:?}, using 1h", s);
                DEFAULT_DURATION
            }
        },
    }
}

fn parse_positive<T>(raw: Option<&str>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|s| s.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

// ============================================================================
// Ingest
// ============================================================================

pub async fn handle_monitoring_data(
    State(state): State<AppState>,
    Json(report): Json<Report>,
) -> Result<impl IntoResponse, ApiError> {
    state.ingest.submit(report).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ============================================================================
// API: Clients
// ============================================================================

pub async fn handle_get_clients(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let clients = run_blocking(&state, |store| store.list_clients()).await?;
    Ok(Json(clients))
}

// ============================================================================
// API: Dashboard
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub client: Option<String>,
    pub duration: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub limit: Option<String>,
    pub status_filter: Option<String>,
    pub min_latency: Option<String>,
    pub max_latency: Option<String>,
}

impl DashboardQuery {
    /// Filter options for the selected client, with dashboard defaults:
    /// newest first, 50 rows, all statuses.
    fn filter_options(&self, client_id: &str) -> HistoryFilterOptions {
        let mut opts = HistoryFilterOptions::new(client_id, parse_duration_or_default(self.duration.as_deref()));
        opts.sort_by = SortColumn::parse(self.sort_by.as_deref().unwrap_or("timestamp"));
        opts.sort_order = SortOrder::parse(self.sort_order.as_deref().unwrap_or("desc"));
        opts.limit = parse_positive(self.limit.as_deref()).unwrap_or(DEFAULT_HISTORY_LIMIT);
        opts.status_filter = StatusFilter::parse(self.status_filter.as_deref().unwrap_or("all"));
        opts.min_latency = parse_positive(self.min_latency.as_deref()).unwrap_or(0.0);
        opts.max_latency = parse_positive(self.max_latency.as_deref()).unwrap_or(0.0);
        opts
    }
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    #[serde(flatten)]
    pub summary: DashboardSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_client: Option<ClientStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub client_history: Vec<Report>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub client_anomalies: Vec<Report>,
}

pub async fn handle_dashboard_data(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let threshold = state.config.online_threshold;
    let statuses = run_blocking(&state, move |store| store.client_statuses(threshold)).await?;
    let summary = DashboardSummary::from_statuses(statuses);

    let selected_client = query
        .client
        .as_deref()
        .filter(|id| !id.is_empty())
        .and_then(|id| summary.clients.iter().find(|c| c.id == id).cloned());

    let mut client_history = Vec::new();
    let mut client_anomalies = Vec::new();

    if let Some(client) = &selected_client {
        let opts = query.filter_options(&client.id);
        let duration = opts.duration;
        let client_id = client.id.clone();

        // History and anomaly failures degrade the page instead of failing it.
        match run_blocking(&state, move |store| store.get_filtered_history(&opts)).await {
            Ok(history) => client_history = history,
            Err(e) => tracing::error!("Error getting filtered history for {}: {}", client_id, e),
        }

        let id = client_id.clone();
        match run_blocking(&state, move |store| {
            store.get_anomalies(&id, DEFAULT_ANOMALY_THRESHOLD_MS, duration, DEFAULT_ANOMALY_LIMIT)
        })
        .await
        {
            Ok(anomalies) => client_anomalies = anomalies,
            Err(e) => tracing::error!("Error getting anomalies for {}: {}", client_id, e),
        }
    }

    Ok(Json(DashboardResponse {
        summary,
        selected_client,
        client_history,
        client_anomalies,
    }))
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub client: String,
    #[serde(default)]
    pub duration: Option<String>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let duration = parse_duration_or_default(query.duration.as_deref());
    let client = query.client;
    let history = run_blocking(&state, move |store| store.get_history(&client, duration)).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    pub client: String,
    #[serde(default)]
    pub threshold_ms: Option<f64>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_get_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomalyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let threshold = query.threshold_ms.unwrap_or(DEFAULT_ANOMALY_THRESHOLD_MS);
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ApiError::BadRequest("threshold_ms must be a non-negative number".to_string()));
    }

    let duration = parse_duration_or_default(query.duration.as_deref());
    let limit = query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);
    let client = query.client;

    let anomalies = run_blocking(&state, move |store| {
        store.get_anomalies(&client, threshold, duration, limit)
    })
    .await?;
    Ok(Json(anomalies))
}
