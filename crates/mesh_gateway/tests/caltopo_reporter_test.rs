mod support;

use axum::http::StatusCode;
use common::domain::{PositionReport, PositionReporter};
use mesh_gateway::CalTopoReporter;
use std::time::{Duration, Instant};
use support::{local_config, unreachable_base_url, FakeCalTopo};
use tokio_util::sync::CancellationToken;

fn report(group: Option<&str>) -> PositionReport {
    PositionReport {
        label: "TEAM-LEAD".to_string(),
        latitude: 61.218846,
        longitude: -149.900132,
        group: group.map(str::to_string),
    }
}

#[tokio::test]
async fn test_report_delivers_to_both_destinations() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("KEY123"), Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.report(&report(None)).await);

    assert_eq!(server.hits("KEY123"), 1);
    assert_eq!(server.hits("GROUP_A"), 1);
    let request = &server.requests()[0];
    assert_eq!(request.params.get("id").map(String::as_str), Some("TEAM-LEAD"));
    assert_eq!(request.params.get("lat").map(String::as_str), Some("61.218846"));
    assert_eq!(request.params.get("lng").map(String::as_str), Some("-149.900132"));
}

#[tokio::test]
async fn test_persistent_server_error_uses_full_retry_budget() {
    let server = FakeCalTopo::new(StatusCode::INTERNAL_SERVER_ERROR);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("KEY123"), None),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(!reporter.report(&report(None)).await);
    assert_eq!(server.hits("KEY123"), 4);
}

#[tokio::test]
async fn test_rate_limiting_is_retried() {
    let server = FakeCalTopo::new(StatusCode::OK);
    server.script(
        "GROUP_A",
        &[StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE],
    );
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, None, Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.report(&report(None)).await);
    assert_eq!(server.hits("GROUP_A"), 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = FakeCalTopo::new(StatusCode::BAD_REQUEST);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("KEY123"), None),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(!reporter.report(&report(None)).await);
    assert_eq!(server.hits("KEY123"), 1);
}

#[tokio::test]
async fn test_one_successful_destination_is_enough() {
    let server = FakeCalTopo::new(StatusCode::OK);
    server.script("KEY123", &[StatusCode::BAD_GATEWAY; 8]);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("KEY123"), Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.report(&report(None)).await);
    assert_eq!(server.hits("KEY123"), 4);
    assert_eq!(server.hits("GROUP_A"), 1);
}

#[tokio::test]
async fn test_invalid_identifier_is_rejected_locally() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("bad-key"), Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.report(&report(None)).await);
    assert_eq!(server.hits("bad-key"), 0);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_group_override_replaces_configured_group() {
    let server = FakeCalTopo::new(StatusCode::OK);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, None, Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.report(&report(Some("BRAVO"))).await);
    assert_eq!(server.hits("BRAVO"), 1);
    assert_eq!(server.hits("GROUP_A"), 0);
}

#[tokio::test]
async fn test_network_errors_are_retried_then_fail() {
    let reporter = CalTopoReporter::new(
        local_config(&unreachable_base_url(), Some("KEY123"), None),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(!reporter.report(&report(None)).await);
}

#[tokio::test]
async fn test_cancellation_stops_retries() {
    let server = FakeCalTopo::new(StatusCode::SERVICE_UNAVAILABLE);
    let base_url = server.serve().await;
    let mut config = local_config(&base_url, Some("KEY123"), None);
    config.retry.base_delay = Duration::from_secs(30);

    let token = CancellationToken::new();
    let reporter = CalTopoReporter::new(config, token.clone()).unwrap();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    assert!(!reporter.report(&report(None)).await);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(server.hits("KEY123"), 1);
}

#[tokio::test]
async fn test_connection_probe_accepts_any_response() {
    let server = FakeCalTopo::new(StatusCode::NOT_FOUND);
    let base_url = server.serve().await;
    let reporter = CalTopoReporter::new(
        local_config(&base_url, Some("KEY123"), Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(reporter.test_connection().await);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].identifier, "KEY123");
    assert_eq!(requests[0].params.get("id").map(String::as_str), Some("TEST"));
}

#[tokio::test]
async fn test_connection_probe_fails_when_unreachable() {
    let reporter = CalTopoReporter::new(
        local_config(&unreachable_base_url(), None, Some("GROUP_A")),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(!reporter.test_connection().await);
}
