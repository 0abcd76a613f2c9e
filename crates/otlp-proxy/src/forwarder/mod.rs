//! Forwarding backends and the submit contract.
//!
//! All three backends expose the same capability set through the [`Forwarder`]
//! trait: `start`, `stop`, `submit`, `queue_depth`. They differ in how
//! admission, concurrency, and rejection are composed:
//!
//! - [`pool::PoolForwarder`] (default): a fixed worker set behind a single
//!   counting permit sized to `workers + queue_capacity`. Submit either takes a
//!   permit or is rejected on the spot, so backpressure is deterministic.
//! - [`semaphore::SemaphoreForwarder`]: spawns one unit per submit and bounds
//!   only in-flight sends. Never rejects; overload turns into latency.
//! - [`hybrid::HybridForwarder`]: a bounded queue for deterministic rejection
//!   feeding a few dispatchers that spawn detached senders under an in-flight
//!   token set.

pub mod hybrid;
pub mod pool;
pub mod semaphore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::OwnedSemaphorePermit;
use tracing::info;

use crate::config::{Config, ForwardingMode};
use crate::metrics::Metrics;

/// One buffered payload on its way to the collector.
///
/// The body is captured by value before submit so no reference to the client's
/// request stream survives the 202 reply. Once submitted, the task is owned by
/// the forwarder until it completes or is discarded on shutdown.
#[derive(Debug)]
pub struct ForwardingTask {
    pub body: Bytes,
    pub target_url: String,
    pub headers: HeaderMap,
}

/// Why a submit was not accepted. Callers translate both variants into 503.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("forwarder queue full (capacity: {capacity})")]
    AtCapacity { capacity: usize },

    #[error("forwarder is stopped")]
    Stopped,
}

/// The capability set shared by all forwarding backends.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Spawns background workers. Idempotent; only the first call has effect.
    fn start(&self);

    /// Drains in-flight work, blocking up to the configured shutdown timeout.
    /// Idempotent; only the first call has effect.
    async fn stop(&self);

    /// Hands a task to the backend. Never blocks on the network.
    fn submit(&self, task: ForwardingTask) -> Result<(), SubmitError>;

    /// Current backlog: queued tasks (pool, hybrid) or units waiting for a
    /// token (semaphore).
    fn queue_depth(&self) -> usize;
}

/// A task sitting in a backend queue. Holds the admission permit (pool mode)
/// for as long as the task is outstanding, and counts the task as failed if it
/// is dropped without ever reaching a sender.
pub(crate) struct QueuedTask {
    task: Option<ForwardingTask>,
    _permit: Option<OwnedSemaphorePermit>,
    metrics: Arc<Metrics>,
}

impl QueuedTask {
    pub(crate) fn new(
        task: ForwardingTask,
        permit: Option<OwnedSemaphorePermit>,
        metrics: Arc<Metrics>,
    ) -> QueuedTask {
        QueuedTask {
            task: Some(task),
            _permit: permit,
            metrics,
        }
    }

    /// Takes the task out for sending. The wrapper keeps holding the permit,
    /// so it must stay alive until the send finishes.
    pub(crate) fn take(&mut self) -> Option<ForwardingTask> {
        self.task.take()
    }
}

impl Drop for QueuedTask {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.metrics.jobs_failed.inc();
        }
    }
}

/// Builds the backend selected by `forwarding_mode`.
pub fn build_forwarder(config: &Config, metrics: Arc<Metrics>) -> Arc<dyn Forwarder> {
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_seconds);

    match config.forwarding_mode {
        ForwardingMode::Pool => {
            let forwarder = pool::PoolForwarder::new(
                config.worker_pool_size,
                config.job_queue_size,
                shutdown_timeout,
                metrics,
            );
            info!(
                "using pool forwarder (workers={}, queue_capacity={})",
                forwarder.worker_count(),
                forwarder.queue_capacity()
            );
            Arc::new(forwarder)
        }
        ForwardingMode::Semaphore => {
            let forwarder = semaphore::SemaphoreForwarder::new(
                config.semaphore_max_concurrent,
                shutdown_timeout,
                metrics,
            );
            info!(
                "using semaphore forwarder (max_concurrent={})",
                forwarder.max_concurrent()
            );
            Arc::new(forwarder)
        }
        ForwardingMode::Hybrid => {
            let forwarder = hybrid::HybridForwarder::new(
                config.worker_pool_size,
                config.job_queue_size,
                config.semaphore_max_concurrent,
                shutdown_timeout,
                metrics,
            );
            info!(
                "using hybrid forwarder (dispatchers={}, queue_capacity={}, max_concurrent={})",
                forwarder.dispatcher_count(),
                forwarder.queue_capacity(),
                forwarder.max_concurrent()
            );
            Arc::new(forwarder)
        }
    }
}
