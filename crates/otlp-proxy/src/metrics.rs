//! Prometheus instruments for the forwarding pipeline.
//!
//! One `Metrics` handle owns its registry and the four instruments; the app
//! builds a single handle and passes it by `Arc` into the forwarder and
//! sender, so tests can create isolated registries instead of fighting over
//! process-wide state.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "otlp_proxy";

/// Counters and gauges shared by the forwarders, the senders, the router
/// middleware, and the `/metrics` exposition endpoint. All instruments are
/// safe under concurrent increment and read.
pub struct Metrics {
    registry: Registry,

    /// Current backlog as reported by the active forwarder.
    pub queue_depth: IntGauge,
    /// Currently in-flight sends.
    pub active_workers: IntGauge,
    /// Tasks whose sender reported 2xx.
    pub jobs_processed: IntCounter,
    /// Tasks whose sender failed: transport error, non-2xx, or discarded on shutdown.
    pub jobs_failed: IntCounter,
    /// Routed HTTP requests by method, route, and status.
    pub http_requests: IntCounterVec,
    /// HTTP request latency by method, route, and status.
    pub http_request_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Current number of queued forwarding tasks")
                .namespace(NAMESPACE),
        )?;
        let active_workers = IntGauge::with_opts(
            Opts::new(
                "active_workers",
                "Current number of in-flight sends to the collector",
            )
            .namespace(NAMESPACE),
        )?;
        let jobs_processed = IntCounter::with_opts(
            Opts::new(
                "jobs_processed_total",
                "Total number of tasks acknowledged by the collector with a 2xx status",
            )
            .namespace(NAMESPACE),
        )?;
        let jobs_failed = IntCounter::with_opts(
            Opts::new(
                "jobs_failed_total",
                "Total number of tasks that failed (transport errors, non-2xx responses)",
            )
            .namespace(NAMESPACE),
        )?;
        let http_requests = IntCounterVec::new(
            Opts::new(
                "http_requests_total",
                "Total HTTP requests handled by the ingress, by method, route, and status",
            )
            .namespace(NAMESPACE),
            &["method", "path", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency by method, route, and status",
            )
            .namespace(NAMESPACE),
            &["method", "path", "status"],
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(jobs_processed.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Metrics {
            registry,
            queue_depth,
            active_workers,
            jobs_processed,
            jobs_failed,
            http_requests,
            http_request_duration,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    /// Content type of [`Metrics::render`] output.
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

/// RAII guard that holds one unit of the active-workers gauge. Incremented on
/// construction, decremented on drop so the gauge stays balanced on every exit
/// path out of a send, including panics.
pub struct ActiveWorkerGuard {
    gauge: IntGauge,
}

impl ActiveWorkerGuard {
    pub fn new(gauge: &IntGauge) -> ActiveWorkerGuard {
        gauge.inc();
        ActiveWorkerGuard {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for ActiveWorkerGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
