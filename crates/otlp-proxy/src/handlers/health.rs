//! Health probes for orchestrator liveness and readiness checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;

/// `GET /healthz`: the process is alive. Always 200.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// `GET /readyz`: 200 while the proxy accepts traffic, 503 once draining.
pub async fn readiness(State(readiness): State<Arc<AtomicBool>>) -> StatusCode {
    if readiness.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
