//! Shared HTTP client construction.
//!
//! One `reqwest::Client` is shared by all senders within a forwarder, with the
//! idle connection pool sized to the forwarder's concurrency ceiling so that
//! connections are reused aggressively under sustained load. HTTP/2 is used
//! when the collector negotiates it via ALPN, and proxy settings are picked up
//! from the environment (`HTTPS_PROXY` et al.), both reqwest defaults.

use std::time::Duration;

use tracing::error;

/// Absolute deadline for each forwarded request, connect included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Builds the forwarding client tuned for `concurrency_ceiling` simultaneous
/// sends. Falls back to a default client if the builder fails, so a bad TLS
/// backend still leaves the proxy able to start.
pub fn forwarding_client(concurrency_ceiling: usize) -> reqwest::Client {
    match build_client(concurrency_ceiling) {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build tuned HTTP client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client(concurrency_ceiling: usize) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(concurrency_ceiling.max(1))
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
}
