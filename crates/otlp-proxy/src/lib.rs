//! # OTLP Proxy
//!
//! An asynchronous HTTP proxy in front of an OpenTelemetry collector. Client-facing
//! endpoints accept OTLP log and trace payloads, inject a collector credential the
//! clients are not allowed to hold, and relay the payloads upstream.
//!
//! The crate is organized around four cooperating pieces:
//! - [`handlers::proxy`]: the ingress adapter that buffers request bodies and decides
//!   the client-facing status from the submit outcome
//! - [`forwarder`]: three interchangeable forwarding backends (pool, semaphore, hybrid)
//!   behind one [`forwarder::Forwarder`] trait
//! - [`sender`]: the upstream sender owning a long-lived pooled HTTP client
//! - [`app`]: the lifecycle controller sequencing startup, drain, and shutdown

#![deny(clippy::all)]
#![deny(unused_extern_crates)]

/// Application lifecycle: startup and shutdown sequencing, router assembly
pub mod app;

/// Configuration loading from `config.toml` with defaults and validation
pub mod config;

/// Forwarding backends and the submit contract
pub mod forwarder;

/// Axum request handlers (proxy ingress, health probes)
pub mod handlers;

/// Shared HTTP client construction
pub mod http;

/// Logging infrastructure and tracing setup
pub mod logger;

/// Prometheus counters and gauges for the forwarding pipeline
pub mod metrics;

/// Router middleware: readiness gate, CORS, queue depth sampling
pub mod middleware;

/// Upstream sender performing the actual POST to the collector
pub mod sender;
