//! Integration tests for the Prometheus metrics endpoint.
//!
//! Each test opens an in-process `EventStore`, serves `GET /metrics` on an ephemeral
//! port, performs store operations, and scrapes the endpoint over raw HTTP/1.1.
//!
//! All tests use `#[serial]` because the metrics recorder is process-global.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crisislog::metrics;
use crisislog::{
    EventCategory, EventQuery, EventStore, HandlerDescriptor, MemoryStorage, NewEvent,
    NewSubscription, NoopDispatcher, StoreConfig,
};
use serde_json::json;
use serial_test::serial;

struct TestServer {
    store: EventStore,
    metrics_addr: SocketAddr,
}

/// Open a store and serve the recorder on an ephemeral port.
///
/// The recorder is installed before the store opens so the recovery gauges land in it.
async fn start_metrics_test_server() -> TestServer {
    let _ = metrics::install_recorder();
    let handle = metrics::get_installed_handle()
        .expect("metrics recorder should be installed after install_recorder() call");

    let store = EventStore::open(
        MemoryStorage::new(),
        StoreConfig::default(),
        Arc::new(NoopDispatcher),
    )
    .expect("open should succeed");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("metrics bind should succeed");
    let metrics_addr = listener.local_addr().expect("should have metrics local addr");
    let _server = metrics::serve_metrics_on_listener(handle, listener);
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer {
        store,
        metrics_addr,
    }
}

/// Scrape `GET /metrics` with a raw HTTP/1.1 request and return headers + body.
async fn scrape_raw(addr: SocketAddr) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("should connect to metrics endpoint");
    let request = format!("GET /metrics HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("should write request");

    let mut buf = Vec::with_capacity(4096);
    stream
        .read_to_end(&mut buf)
        .await
        .expect("should read response");
    String::from_utf8(buf).expect("response should be valid UTF-8")
}

async fn scrape_body(addr: SocketAddr) -> String {
    let raw = scrape_raw(addr).await;
    raw.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

/// Value of the first line starting with `prefix`, e.g. `crisislog_appends_total `.
fn parse_metric_value(rendered: &str, prefix: &str) -> Option<f64> {
    rendered.lines().find_map(|line| {
        line.strip_prefix(prefix)
            .and_then(|rest| rest.trim().parse::<f64>().ok())
    })
}

fn event(event_type: &str) -> NewEvent {
    NewEvent::new(event_type, EventCategory::Domain, json!({}))
}

#[tokio::test]
#[serial]
async fn metrics_endpoint_returns_200_with_correct_content_type() {
    let server = start_metrics_test_server().await;
    let raw = scrape_raw(server.metrics_addr).await;

    let first_line = raw.lines().next().expect("response should have a first line");
    assert!(first_line.contains("200"), "expected 200 status, got: {first_line}");

    let headers = raw
        .split_once("\r\n\r\n")
        .map(|(h, _)| h.to_lowercase())
        .unwrap_or_default();
    assert!(
        headers.contains("text/plain") && headers.contains("version=0.0.4"),
        "unexpected content type, got headers: {headers}"
    );
    server.store.shutdown().await;
}

#[tokio::test]
#[serial]
async fn append_counters_and_gauges_track_the_log() {
    let server = start_metrics_test_server().await;
    let before = scrape_body(server.metrics_addr).await;
    let appends_before = parse_metric_value(&before, "crisislog_appends_total ").unwrap_or(0.0);
    let events_before =
        parse_metric_value(&before, "crisislog_events_appended_total ").unwrap_or(0.0);
    let dedup_before =
        parse_metric_value(&before, "crisislog_appends_deduplicated_total ").unwrap_or(0.0);

    let store = &server.store;
    store.append("alert-1", event("AlertCreated")).await.expect("append");
    let retried = vec![event("PatientTriaged").with_event_id(uuid::Uuid::new_v4())];
    store
        .append_batch("triage-1", retried.clone())
        .await
        .expect("batch");
    store
        .append_batch("triage-1", retried)
        .await
        .expect("retried batch");

    let after = scrape_body(server.metrics_addr).await;
    let appends_after = parse_metric_value(&after, "crisislog_appends_total ")
        .expect("crisislog_appends_total should exist");
    let events_after = parse_metric_value(&after, "crisislog_events_appended_total ")
        .expect("crisislog_events_appended_total should exist");
    let dedup_after = parse_metric_value(&after, "crisislog_appends_deduplicated_total ")
        .expect("crisislog_appends_deduplicated_total should exist");

    assert_eq!(appends_after - appends_before, 2.0);
    assert_eq!(events_after - events_before, 2.0);
    assert_eq!(dedup_after - dedup_before, 1.0);

    // Gauges are set by the last writer that ran, which is this store's.
    assert_eq!(parse_metric_value(&after, "crisislog_head_position "), Some(2.0));
    assert_eq!(parse_metric_value(&after, "crisislog_streams "), Some(2.0));
    server.store.shutdown().await;
}

#[tokio::test]
#[serial]
async fn append_latency_histogram_is_rendered() {
    let server = start_metrics_test_server().await;
    server
        .store
        .append("cert-1", event("CertIssued"))
        .await
        .expect("append");

    let body = scrape_body(server.metrics_addr).await;
    for needle in [
        "crisislog_append_duration_seconds_sum",
        "crisislog_append_duration_seconds_count",
        "crisislog_append_duration_seconds{quantile=",
    ] {
        assert!(body.contains(needle), "body should contain {needle}");
    }
    server.store.shutdown().await;
}

#[tokio::test]
#[serial]
async fn reads_and_snapshots_are_counted() {
    let server = start_metrics_test_server().await;
    let store = &server.store;
    store.append("alert-1", event("AlertCreated")).await.expect("append");

    let before = scrape_body(server.metrics_addr).await;
    let query_before =
        parse_metric_value(&before, "crisislog_reads_total{op=\"query\"} ").unwrap_or(0.0);
    let snapshots_before =
        parse_metric_value(&before, "crisislog_snapshots_created_total ").unwrap_or(0.0);

    store.query(&EventQuery::default()).expect("query");
    store.query(&EventQuery::default()).expect("query");
    store
        .create_snapshot("alert-1", Bytes::from_static(b"{}"))
        .await
        .expect("snapshot");

    let after = scrape_body(server.metrics_addr).await;
    let query_after = parse_metric_value(&after, "crisislog_reads_total{op=\"query\"} ")
        .expect("query read counter should exist");
    let snapshots_after = parse_metric_value(&after, "crisislog_snapshots_created_total ")
        .expect("snapshot counter should exist");
    assert_eq!(query_after - query_before, 2.0);
    assert_eq!(snapshots_after - snapshots_before, 1.0);
    store.shutdown().await;
}

#[tokio::test]
#[serial]
async fn subscription_gauge_follows_lifecycle() {
    let server = start_metrics_test_server().await;
    let store = &server.store;

    let before = scrape_body(server.metrics_addr).await;
    let active_before =
        parse_metric_value(&before, "crisislog_subscriptions_active ").unwrap_or(0.0);

    store
        .create_subscription(NewSubscription::new(
            "ops",
            "alert-*",
            HandlerDescriptor::new("log", "ops"),
        ))
        .expect("create");
    let during = scrape_body(server.metrics_addr).await;
    assert_eq!(
        parse_metric_value(&during, "crisislog_subscriptions_active "),
        Some(active_before + 1.0)
    );

    store.delete_subscription("ops").expect("delete");
    let after = scrape_body(server.metrics_addr).await;
    assert_eq!(
        parse_metric_value(&after, "crisislog_subscriptions_active "),
        Some(active_before)
    );
    store.shutdown().await;
}
