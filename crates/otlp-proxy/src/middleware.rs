//! Router middleware: CORS, readiness gating, HTTP instrumentation, queue
//! depth sampling.
//!
//! Layer order matters and mirrors the ingress chain: CORS runs first so that
//! rejections produced further in (413 from the size limit, 503 from the
//! readiness gate) still carry CORS headers, the size limit runs before the
//! readiness gate, and per-route instrumentation sits closest to the handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::forwarder::Forwarder;
use crate::metrics::Metrics;

/// Paths that stay reachable while the proxy is draining.
const ALWAYS_SERVED_PATHS: [&str; 3] = ["/healthz", "/readyz", "/metrics"];

const ALLOW_METHODS: &str = "POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Content-Encoding, X-Client-Id, Authorization, \
     Accept, Origin, User-Agent, Traceparent, Baggage, X-Requested-With";

/// Rejects new work with an empty 503 while the readiness flag is down,
/// keeping only the health and metrics endpoints reachable so external
/// routing layers can observe the drain.
pub async fn readiness_gate(
    State(readiness): State<Arc<AtomicBool>>,
    request: Request,
    next: Next,
) -> Response {
    if !readiness.load(Ordering::SeqCst) {
        let path = request.uri().path();
        if !ALWAYS_SERVED_PATHS.contains(&path) {
            info!("readiness=false: rejecting new request path={path}");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    next.run(request).await
}

/// Refreshes the queue depth gauge from the active forwarder on every request,
/// so `/metrics` always reflects a recent observation.
#[derive(Clone)]
pub struct QueueDepthState {
    pub forwarder: Arc<dyn Forwarder>,
    pub metrics: Arc<Metrics>,
}

pub async fn sample_queue_depth(
    State(state): State<QueueDepthState>,
    request: Request,
    next: Next,
) -> Response {
    state
        .metrics
        .queue_depth
        .set(state.forwarder.queue_depth() as i64);
    next.run(request).await
}

/// Records every routed request in the HTTP request counter and latency
/// histogram, labeled by method, route, and status. Applied as a route layer
/// so the matched route template is available as the `path` label.
pub async fn track_http_metrics(
    State(metrics): State<Arc<Metrics>>,
    matched_path: MatchedPath,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let labels = [method.as_str(), matched_path.as_str(), status.as_str()];
    metrics.http_requests.with_label_values(&labels).inc();
    metrics
        .http_request_duration
        .with_label_values(&labels)
        .observe(started.elapsed().as_secs_f64());
    response
}

/// CORS policy for the browser-facing ingress.
///
/// A configured `"*"` mirrors the request origin back instead of sending a
/// literal wildcard, because the ingress allows credentials and browsers
/// refuse `Access-Control-Allow-Origin: *` on credentialed requests.
#[derive(Clone)]
pub struct CorsPolicy {
    origins: Vec<String>,
    allow_any: bool,
}

impl CorsPolicy {
    pub fn new(allowed_origins: &[String]) -> CorsPolicy {
        CorsPolicy {
            allow_any: allowed_origins.iter().any(|o| o == "*"),
            origins: allowed_origins.to_vec(),
        }
    }

    fn allows(&self, origin: &str) -> bool {
        self.allow_any || self.origins.iter().any(|o| o == origin)
    }
}

pub async fn cors(
    State(policy): State<CorsPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let allowed_origin = match origin {
        Some(origin) if policy.allows(&origin) => match HeaderValue::from_str(&origin) {
            Ok(value) => value,
            Err(_) => return next.run(request).await,
        },
        // Non-browser traffic or a disallowed origin: no CORS headers at all.
        _ => return next.run(request).await,
    };

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response, &allowed_origin);
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&mut response, &allowed_origin);
    response
}

fn apply_cors_headers(response: &mut Response, origin: &HeaderValue) {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
}
