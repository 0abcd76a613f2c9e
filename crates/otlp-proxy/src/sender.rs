//! Upstream sender: one POST per task against the collector.
//!
//! The sender is shared by all workers of a forwarder and owns the pooled HTTP
//! client. It classifies every outcome into the processed/failed counters and
//! keeps the active-workers gauge balanced on every exit path. No back-channel
//! to the client exists here; failures are visible only via metrics and logs.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::forwarder::ForwardingTask;
use crate::http::forwarding_client;
use crate::metrics::{ActiveWorkerGuard, Metrics};

pub struct UpstreamSender {
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl UpstreamSender {
    /// Creates a sender with the connection pool sized to the forwarder's
    /// concurrency ceiling.
    pub fn new(metrics: Arc<Metrics>, concurrency_ceiling: usize) -> UpstreamSender {
        UpstreamSender {
            client: forwarding_client(concurrency_ceiling),
            metrics,
        }
    }

    /// Forwards one task. Status in [200, 300) counts as processed; everything
    /// else, including transport errors, counts as failed.
    pub async fn send(&self, task: ForwardingTask) {
        let _active = ActiveWorkerGuard::new(&self.metrics.active_workers);

        let ForwardingTask {
            body,
            target_url,
            headers,
        } = task;

        let response = self
            .client
            .post(&target_url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                // Drain the response body so the connection goes back to the pool.
                let _ = response.bytes().await;

                if status.is_success() {
                    debug!("forwarded to {target_url}: {status}");
                    self.metrics.jobs_processed.inc();
                } else {
                    warn!("collector returned {status} for {target_url}");
                    self.metrics.jobs_failed.inc();
                }
            }
            Err(e) => {
                error!("forwarding to {target_url} failed: {e}");
                self.metrics.jobs_failed.inc();
            }
        }
    }
}
