//! Ingress adapter for the OTLP proxy endpoints.
//!
//! The async path buffers the request body, scrubs hop-by-hop headers, injects
//! the collector credential, and hands the task to the forwarder. The reply is
//! decided from the submit outcome alone: 202 on acceptance, 503 on
//! backpressure, 400 when the body cannot be read. The adapter never waits for
//! the collector.
//!
//! When `sync_logs_debug` is enabled, `/v1/logs` is instead proxied
//! synchronously and the collector's status and body are relayed to the
//! caller. Both paths share one header-scrubbing function.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::{error, warn};

use crate::forwarder::{Forwarder, ForwardingTask};

const LOGS_PATH: &str = "/v1/logs";
const TRACES_PATH: &str = "/v1/traces";

const DEFAULT_CONTENT_TYPE: &str = "application/x-protobuf";

/// RFC 7230 hop-by-hop headers, never forwarded to the collector.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Response headers not relayed back to the caller on the sync debug path.
/// CORS headers are owned by the proxy's own middleware.
const SKIPPED_RESPONSE_HEADERS: [&str; 4] =
    ["vary", "content-length", "transfer-encoding", "connection"];

#[derive(Clone)]
pub struct ProxyState {
    pub target_url: String,
    pub api_key: String,
    pub forwarder: Arc<dyn Forwarder>,
    pub sync_logs_debug: bool,
    /// Client used only by the sync debug path; the forwarders own their own.
    pub sync_client: reqwest::Client,
}

/// `POST /v1/logs`: async forward by default, sync passthrough in debug mode.
pub async fn logs(State(state): State<ProxyState>, request: Request) -> Response {
    if state.sync_logs_debug {
        forward_sync(&state, request, LOGS_PATH).await
    } else {
        forward_async(&state, request, LOGS_PATH).await
    }
}

/// `POST /v1/traces`: always async, traces are fire-and-forget.
pub async fn traces(State(state): State<ProxyState>, request: Request) -> Response {
    forward_async(&state, request, TRACES_PATH).await
}

async fn forward_async(state: &ProxyState, request: Request, path: &str) -> Response {
    let (parts, body) = match extract_request_body(request).await {
        Ok(extracted) => extracted,
        Err(response) => return response,
    };

    let headers = build_upstream_headers(&parts.headers, &state.api_key);
    let task = ForwardingTask {
        body,
        target_url: format!("{}{}", state.target_url, path),
        headers,
    };

    match state.forwarder.submit(task) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!("rejecting request to {path}: {e}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn forward_sync(state: &ProxyState, request: Request, path: &str) -> Response {
    let (parts, body) = match extract_request_body(request).await {
        Ok(extracted) => extracted,
        Err(response) => return response,
    };

    let headers = build_upstream_headers(&parts.headers, &state.api_key);
    let target_url = format!("{}{}", state.target_url, path);

    let upstream = match state
        .sync_client
        .post(&target_url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            error!("upstream error (sync logs): {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();
    let relayed_headers = build_relayed_response_headers(upstream.headers());
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!("failed to read upstream response body (sync logs): {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = relayed_headers;
    response
}

/// Splits a request into its parts and fully buffered body. Returns the
/// ready-made error response (400 on read failure, 413 past the size limit)
/// when buffering fails.
async fn extract_request_body(request: Request) -> Result<(http::request::Parts, Bytes), Response> {
    let (parts, body) = request.into_parts();
    match Bytes::from_request(Request::from_parts(parts.clone(), body), &()).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(rejection) => {
            warn!("failed to read request body: {rejection}");
            Err(rejection.into_response())
        }
    }
}

/// Builds the outbound header set: every incoming header except `Host` and the
/// hop-by-hop set, multi-values preserved, with `Content-Type` defaulted and
/// the configured credential overriding any inbound `Authorization`.
pub fn build_upstream_headers(incoming: &HeaderMap, api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);

    for (name, value) in incoming {
        if *name == HOST || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }

    // Overrides any client-supplied value so the credential cannot be spoofed.
    // An empty key disables injection entirely.
    if !api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert(AUTHORIZATION, value);
        }
    }

    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    // HeaderName::as_str is always lowercase.
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn build_relayed_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let lowered = name.as_str();
        if lowered.starts_with("access-control-") || SKIPPED_RESPONSE_HEADERS.contains(&lowered) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
