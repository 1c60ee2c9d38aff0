#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use mesh_gateway::{CalTopoReporterConfig, RetryPolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub identifier: String,
    pub params: HashMap<String, String>,
}

/// Stand-in for the CalTopo position report endpoint.
///
/// Each identifier answers with its queued statuses in order, then with
/// `default_status`.
pub struct FakeCalTopo {
    scripted: Mutex<HashMap<String, VecDeque<StatusCode>>>,
    default_status: StatusCode,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeCalTopo {
    pub fn new(default_status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(HashMap::new()),
            default_status,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, identifier: &str, statuses: &[StatusCode]) {
        self.scripted
            .lock()
            .unwrap()
            .insert(identifier.to_string(), statuses.iter().copied().collect());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self, identifier: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.identifier == identifier)
            .count()
    }

    /// Serve on an ephemeral local port, returning the base URL
    pub async fn serve(self: &Arc<Self>) -> String {
        let app = Router::new()
            .route("/api/v1/position/report/:identifier", get(report))
            .with_state(Arc::clone(self));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/v1/position/report", addr)
    }
}

async fn report(
    State(server): State<Arc<FakeCalTopo>>,
    Path(identifier): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    server.requests.lock().unwrap().push(RecordedRequest {
        identifier: identifier.clone(),
        params,
    });
    server
        .scripted
        .lock()
        .unwrap()
        .get_mut(&identifier)
        .and_then(VecDeque::pop_front)
        .unwrap_or(server.default_status)
}

/// Reporter config aimed at a local server with millisecond backoff
pub fn local_config(
    base_url: &str,
    connect_key: Option<&str>,
    group: Option<&str>,
) -> CalTopoReporterConfig {
    CalTopoReporterConfig {
        connect_key: connect_key.map(str::to_string),
        group: group.map(str::to_string),
        base_url: base_url.to_string(),
        allowed_test_urls: vec![base_url.to_string()],
        request_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(1),
        },
    }
}

/// Base URL on a local port nothing listens on
pub fn unreachable_base_url() -> String {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    format!("http://127.0.0.1:{}/api/v1/position/report", port)
}
