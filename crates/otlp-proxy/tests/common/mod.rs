//! Shared test fixtures: a mock collector that captures forwarded requests,
//! and helpers for building a proxy around it.

// Each test binary uses a subset of these helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use otlp_proxy::config::Config;

/// One request as seen by the mock collector.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().copied()
    }
}

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    status: StatusCode,
    response_body: &'static str,
    delay: Duration,
}

/// Mock collector bound to an ephemeral port.
pub struct MockCollector {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockCollector {
    pub async fn start(
        status: StatusCode,
        response_body: &'static str,
        delay: Duration,
    ) -> MockCollector {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            requests: Arc::clone(&requests),
            status,
            response_body,
            delay,
        };

        let app = Router::new()
            .route("/v1/logs", post(capture))
            .route("/v1/traces", post(capture))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock collector should bind");
        let addr = listener.local_addr().expect("mock collector address");
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock collector server failed");
        });

        MockCollector { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Polls until `count` requests have arrived or two seconds pass.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<CapturedRequest> {
        for _ in 0..100 {
            let captured = self.captured();
            if captured.len() >= count {
                return captured;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.captured()
    }
}

async fn capture(State(state): State<MockState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let headers = request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .expect("mock collector should read the body")
        .to_vec();

    state.requests.lock().unwrap().push(CapturedRequest {
        path,
        headers,
        body,
    });

    if state.delay > Duration::ZERO {
        tokio::time::sleep(state.delay).await;
    }

    (state.status, state.response_body).into_response()
}

/// A proxy configuration pointed at the mock collector: ephemeral port, no
/// drain window, short shutdown timeout. Tests override what they need.
pub fn test_config(collector_url: String) -> Config {
    Config {
        otel_collector_target_url: collector_url,
        server_port: 0,
        shutdown_drain_seconds: 0,
        shutdown_timeout_seconds: 5,
        // Keep pools small in tests; the default auto-sizes to 50 x CPU count.
        worker_pool_size: 4,
        ..Config::default()
    }
}
