//! End-to-end tests for the ingress endpoints against a mock collector.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use otlp_proxy::app::App;
use otlp_proxy::config::Config;

use common::{test_config, MockCollector};

async fn start_proxy(config: Config) -> (Arc<App>, String) {
    let app = Arc::new(App::new(config).expect("app should build"));
    app.start().await.expect("app should start");
    let addr = app.local_addr().expect("bound address");
    (app, format!("http://{addr}"))
}

async fn fetch_metrics(client: &reqwest::Client, base_url: &str) -> String {
    client
        .get(format!("{base_url}/metrics"))
        .send()
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body")
}

/// Polls `/metrics` until `needle` shows up or two seconds pass.
async fn wait_for_metric(client: &reqwest::Client, base_url: &str, needle: &str) -> bool {
    for _ in 0..100 {
        if fetch_metrics(client, base_url).await.contains(needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn logs_are_forwarded_with_injected_credential() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let mut config = test_config(collector.base_url());
    config.otel_collector_api_key = "k".to_string();
    let (app, base_url) = start_proxy(config).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/logs"))
        .header("Authorization", "client-should-not-win")
        .body("hello")
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.text().await.unwrap().is_empty());

    let captured = collector.wait_for_requests(1).await;
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/v1/logs");
    assert_eq!(captured[0].body, b"hello");
    assert_eq!(captured[0].header_values("authorization"), vec!["k"]);

    assert!(
        wait_for_metric(&client, &base_url, "otlp_proxy_jobs_processed_total 1").await,
        "collector 200 should increment the processed counter"
    );

    app.shutdown().await;
}

#[tokio::test]
async fn trace_failures_are_counted_not_surfaced() {
    let collector =
        MockCollector::start(StatusCode::INTERNAL_SERVER_ERROR, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    let body = vec![b'x'; 1024 * 1024];
    let response = client
        .post(format!("{base_url}/v1/traces"))
        .body(body)
        .send()
        .await
        .expect("request should succeed");

    // The client still sees 202; the failure is visible only in metrics.
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    collector.wait_for_requests(1).await;
    assert!(
        wait_for_metric(&client, &base_url, "otlp_proxy_jobs_failed_total 1").await,
        "upstream 500 should increment the failure counter"
    );

    app.shutdown().await;
}

#[tokio::test]
async fn hop_by_hop_headers_are_scrubbed_and_the_rest_preserved() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{base_url}/v1/logs"))
        .header("X-Client-Id", "browser-7")
        .header("X-Trace-Tag", "a")
        .header("Traceparent", "00-abc-def-01")
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .expect("request should succeed");

    let captured = collector.wait_for_requests(1).await;
    let request = &captured[0];

    assert_eq!(request.header("x-client-id"), Some("browser-7"));
    assert_eq!(request.header("x-trace-tag"), Some("a"));
    assert_eq!(request.header("traceparent"), Some("00-abc-def-01"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    // Hop-by-hop names never cross the proxy.
    assert_eq!(request.header("proxy-connection"), None);
    assert_eq!(request.header("te"), None);

    app.shutdown().await;
}

#[tokio::test]
async fn empty_credential_means_no_authorization_header() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{base_url}/v1/logs"))
        .body("payload")
        .send()
        .await
        .expect("request should succeed");

    let captured = collector.wait_for_requests(1).await;
    assert_eq!(captured[0].header("authorization"), None);
    // Content type is defaulted for OTLP when the client sends none.
    assert_eq!(
        captured[0].header("content-type"),
        Some("application/x-protobuf")
    );

    app.shutdown().await;
}

#[tokio::test]
async fn pooled_backpressure_turns_into_503() {
    let collector =
        MockCollector::start(StatusCode::OK, "", Duration::from_millis(500)).await;

    // Total capacity workers + queue = 2: three concurrent submits against a
    // slow collector must produce exactly one 503.
    let mut config = test_config(collector.base_url());
    config.worker_pool_size = 1;
    config.job_queue_size = 1;
    let (app, base_url) = start_proxy(config).await;

    let client = reqwest::Client::new();
    let post = |client: reqwest::Client, base_url: String| async move {
        client
            .post(format!("{base_url}/v1/traces"))
            .body("payload")
            .send()
            .await
            .expect("request should succeed")
            .status()
    };

    let (a, b, c) = tokio::join!(
        post(client.clone(), base_url.clone()),
        post(client.clone(), base_url.clone()),
        post(client.clone(), base_url.clone()),
    );

    let statuses = [a, b, c];
    let accepted = statuses.iter().filter(|s| **s == StatusCode::ACCEPTED).count();
    let rejected = statuses
        .iter()
        .filter(|s| **s == StatusCode::SERVICE_UNAVAILABLE)
        .count();
    assert_eq!(accepted, 2, "two submits fit capacity, got {statuses:?}");
    assert_eq!(rejected, 1, "one submit must see backpressure, got {statuses:?}");

    app.shutdown().await;
}

#[tokio::test]
async fn sync_debug_relays_the_collector_response() {
    let collector =
        MockCollector::start(StatusCode::IM_A_TEAPOT, "teapot", Duration::ZERO).await;
    let mut config = test_config(collector.base_url());
    config.sync_logs_debug = true;
    let (app, base_url) = start_proxy(config).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/logs"))
        .body("hello")
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.text().await.unwrap(), "teapot");

    // Traces stay async even in debug mode.
    let response = client
        .post(format!("{base_url}/v1/traces"))
        .body("hello")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    app.shutdown().await;
}

#[tokio::test]
async fn cors_preflight_returns_204_with_credentials() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("{base_url}/v1/logs"))
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .expect("preflight should succeed");

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "http://localhost:3000"
    );
    assert_eq!(
        headers.get("access-control-allow-credentials").unwrap(),
        "true"
    );
    assert!(headers
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("POST"));

    app.shutdown().await;
}

#[tokio::test]
async fn disallowed_origin_gets_no_cors_headers() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let mut config = test_config(collector.base_url());
    config.allowed_origins = vec!["https://app.example.com".to_string()];
    let (app, base_url) = start_proxy(config).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/logs"))
        .header("Origin", "https://evil.example.com")
        .body("payload")
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().get("access-control-allow-origin").is_none());

    app.shutdown().await;
}

#[tokio::test]
async fn oversize_body_is_413_and_still_carries_cors_headers() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    // Default limit is 1 MB; send two.
    let body = vec![b'x'; 2 * 1024 * 1024];
    let response = client
        .post(format!("{base_url}/v1/logs"))
        .header("Origin", "http://localhost:3000")
        .body(body)
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://localhost:3000"
    );
    assert!(collector.captured().is_empty());

    app.shutdown().await;
}

#[tokio::test]
async fn routed_requests_are_instrumented_per_route() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/logs"))
        .body("payload")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert!(
        wait_for_metric(
            &client,
            &base_url,
            r#"otlp_proxy_http_requests_total{method="POST",path="/v1/logs",status="202"} 1"#,
        )
        .await,
        "routed requests should be counted by method, route, and status"
    );
    let metrics = fetch_metrics(&client, &base_url).await;
    assert!(metrics.contains("otlp_proxy_http_request_duration_seconds_bucket"));

    app.shutdown().await;
}

#[tokio::test]
async fn unknown_paths_fall_back_to_404() {
    let collector = MockCollector::start(StatusCode::OK, "", Duration::ZERO).await;
    let (app, base_url) = start_proxy(test_config(collector.base_url())).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/v2/profiles"))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.shutdown().await;
}
