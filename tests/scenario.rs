//! End-to-end check of ingest followed by the derived status view.

use chrono::{Duration as ChronoDuration, Utc};
use probetrail::db::{HistoryFilterOptions, Report, SortColumn, SortOrder, StatusFilter, Store};
use std::time::Duration;
use tempfile::NamedTempFile;

fn probe(latency: f64, status_code: i64, error: Option<&str>) -> Report {
    let mut report = Report {
        client_id: "agent-1".to_string(),
        target_url: "https://status.example.net".to_string(),
        ..Default::default()
    };
    report.timing_metrics.total_response_ms = latency;
    report.timing_metrics.first_byte_ms = latency / 2.0;
    report.response_details.status_code = status_code;
    if let Some(kind) = error {
        report.error_details.has_error = true;
        report.error_details.error_type = kind.to_string();
    }
    report
}

#[test]
fn three_reports_produce_expected_status() {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();

    let t0 = Utc::now() - ChronoDuration::seconds(10);
    let t1 = t0 + ChronoDuration::seconds(1);
    let t2 = t0 + ChronoDuration::seconds(2);

    store.submit_report_at(&probe(95.0, 200, None), t0).unwrap();
    store.submit_report_at(&probe(1200.0, 504, Some("timeout")), t1).unwrap();
    store.submit_report_at(&probe(80.0, 200, None), t2).unwrap();

    let statuses = store.client_statuses(Duration::from_secs(60)).unwrap();
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];

    assert!(status.is_online);
    assert_eq!(status.last_seen, t2);
    assert_eq!(status.last_status_code, 200);
    assert_eq!(status.last_latency, 80.0);
    assert_eq!(status.timing_breakdown.first_byte_ms, 40.0);
    assert_eq!(status.last_error, "timeout");
    assert_eq!(status.last_error_time, Some(t1));
    assert_eq!(status.checks_in_window, 3);
    assert!((status.success_rate - 66.67).abs() < 0.01);

    let anomalies = store
        .get_anomalies("agent-1", 1000.0, Duration::from_secs(3600), 0)
        .unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].error_details.error_type, "timeout");

    let mut opts = HistoryFilterOptions::new("agent-1", Duration::from_secs(3600));
    opts.status_filter = StatusFilter::Success;
    opts.sort_by = SortColumn::Latency;
    opts.sort_order = SortOrder::Asc;
    let ok: Vec<f64> = store
        .get_filtered_history(&opts)
        .unwrap()
        .iter()
        .map(|r| r.timing_metrics.total_response_ms)
        .collect();
    assert_eq!(ok, vec![80.0, 95.0]);
}

#[test]
fn reopening_keeps_data() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let store = Store::new(tmp.path()).unwrap();
        store.submit_report(&probe(12.0, 200, None)).unwrap();
    }

    let store = Store::new(tmp.path()).unwrap();
    assert_eq!(store.list_clients().unwrap().len(), 1);
    assert_eq!(store.get_history("agent-1", Duration::from_secs(60)).unwrap().len(), 1);
}
