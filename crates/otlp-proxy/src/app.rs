//! Application lifecycle: startup and shutdown sequencing.
//!
//! Startup order guarantees the forwarder is running before the listener
//! accepts its first connection, and the readiness flag flips to `true` only
//! once everything behind it is in place. Shutdown runs the reverse ladder:
//! readiness down, a fixed drain window so external load balancers observe the
//! non-ready state, forwarder stop bounded by the shutdown timeout, and the
//! HTTP server last. Both sequences are one-shot; repeated signals neither
//! restart nor accelerate them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::forwarder::{build_forwarder, Forwarder};
use crate::handlers::{health, proxy};
use crate::http::forwarding_client;
use crate::metrics::Metrics;
use crate::middleware::{self, CorsPolicy, QueueDepthState};

/// Idle pool size for the sync debug client; the forwarders size their own.
const SYNC_CLIENT_POOL_SIZE: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to build metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// The assembled proxy: configuration, forwarder, metrics, and HTTP server.
pub struct App {
    config: Config,
    metrics: Arc<Metrics>,
    forwarder: Arc<dyn Forwarder>,
    readiness: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    shutdown_started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    server_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl App {
    pub fn new(config: Config) -> Result<App, AppError> {
        let metrics = Arc::new(Metrics::new()?);
        let forwarder = build_forwarder(&config, Arc::clone(&metrics));

        Ok(App {
            config,
            metrics,
            forwarder,
            readiness: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            server_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts the forwarder, binds the listener, flips readiness, and begins
    /// serving in a background task. Returns once the listener is bound.
    pub async fn start(&self) -> Result<(), AppError> {
        self.forwarder.start();

        let router = self.router();
        let bind_addr = format!("0.0.0.0:{}", self.config.server_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| AppError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| AppError::Bind {
                addr: bind_addr,
                source,
            })?;
        let _ = self.local_addr.set(addr);

        info!("starting OTLP proxy server on {addr}");

        // Readiness flips before the accept loop starts; probes that see
        // `ready` are guaranteed a serving listener.
        self.readiness.store(true, Ordering::SeqCst);

        let token = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("server error: {e}");
            }
        });
        *self.server_handle.lock().await = Some(handle);

        Ok(())
    }

    /// Runs the shutdown ladder. One-shot: later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down gracefully...");

        self.readiness.store(false, Ordering::SeqCst);
        let drain = Duration::from_secs(self.config.shutdown_drain_seconds);
        info!("readiness=false: starting drain window of {drain:?}");
        // Pure wall-clock: the window exists so external routing layers can
        // observe the non-ready state, regardless of traffic.
        tokio::time::sleep(drain).await;

        info!("stopping forwarder...");
        self.forwarder.stop().await;

        self.shutdown_token.cancel();
        let budget = Duration::from_secs(self.config.shutdown_timeout_seconds);
        let handle = self.server_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(budget, &mut handle).await {
                Ok(_) => info!("server stopped gracefully"),
                Err(_) => {
                    warn!("server shutdown timed out after {budget:?}");
                    handle.abort();
                }
            }
        }
    }

    /// The address the listener is bound to, once [`App::start`] has returned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn router(&self) -> Router {
        let proxy_state = proxy::ProxyState {
            target_url: self.config.otel_collector_target_url.clone(),
            api_key: self.config.otel_collector_api_key.clone(),
            forwarder: Arc::clone(&self.forwarder),
            sync_logs_debug: self.config.sync_logs_debug,
            sync_client: forwarding_client(SYNC_CLIENT_POOL_SIZE),
        };
        let proxy_router = Router::new()
            .route("/v1/logs", post(proxy::logs))
            .route("/v1/traces", post(proxy::traces))
            .with_state(proxy_state);

        let health_router = Router::new()
            .route("/healthz", get(health::liveness))
            .route("/readyz", get(health::readiness))
            .with_state(Arc::clone(&self.readiness));

        let metrics_router = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&self.metrics));

        let queue_depth_state = QueueDepthState {
            forwarder: Arc::clone(&self.forwarder),
            metrics: Arc::clone(&self.metrics),
        };

        // Layers wrap outward (the last one added runs first), so requests
        // flow CORS -> size limit -> readiness gate -> queue depth sampling ->
        // routing -> per-route instrumentation -> handler. CORS is outermost
        // so 413/503 responses still carry its headers, and the size limit
        // runs before the readiness gate so an oversized request is answered
        // 413 even while draining.
        Router::new()
            .merge(proxy_router)
            .merge(health_router)
            .merge(metrics_router)
            .route_layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.metrics),
                middleware::track_http_metrics,
            ))
            .fallback(handler_not_found)
            .layer(axum::middleware::from_fn_with_state(
                queue_depth_state,
                middleware::sample_queue_depth,
            ))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.readiness),
                middleware::readiness_gate,
            ))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(
                self.config.max_request_size_mb * 1024 * 1024,
            ))
            .layer(axum::middleware::from_fn_with_state(
                CorsPolicy::new(&self.config.allowed_origins),
                middleware::cors,
            ))
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, metrics.content_type())], text).into_response(),
        Err(e) => {
            error!("failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handler_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Resolves on the first `SIGINT` or `SIGTERM`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, starting graceful shutdown..."),
        () = terminate => info!("received SIGTERM, starting graceful shutdown..."),
    }
}
