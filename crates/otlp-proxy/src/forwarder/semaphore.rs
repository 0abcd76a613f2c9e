//! Semaphore forwarder: no queue, no fixed worker set.
//!
//! Every submit spawns a task-scoped unit that blocks on one of
//! `max_concurrent` tokens before sending. Submit never rejects, so
//! backpressure shows up as latency instead of 503s; under sustained overload
//! the backlog of waiting units is unbounded. Queue depth reports the number
//! of units currently waiting for a token.
//!
//! During shutdown, submits are silently dropped rather than rejected; the
//! readiness gate in front of the router is what actually stops new traffic.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::forwarder::{Forwarder, ForwardingTask, SubmitError};
use crate::metrics::Metrics;
use crate::sender::UpstreamSender;

const DEFAULT_MAX_CONCURRENT: usize = 10_000;

pub struct SemaphoreForwarder {
    max_concurrent: usize,
    /// Gates in-flight HTTP requests, not acceptance.
    tokens: Arc<Semaphore>,
    waiters: Arc<AtomicI64>,
    sender: Arc<UpstreamSender>,
    metrics: Arc<Metrics>,
    units: TaskTracker,
    abort: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_timeout: Duration,
}

impl SemaphoreForwarder {
    pub fn new(
        max_concurrent: i64,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> SemaphoreForwarder {
        let max_concurrent = if max_concurrent <= 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent as usize
        };

        SemaphoreForwarder {
            max_concurrent,
            tokens: Arc::new(Semaphore::new(max_concurrent)),
            waiters: Arc::new(AtomicI64::new(0)),
            sender: Arc::new(UpstreamSender::new(Arc::clone(&metrics), max_concurrent)),
            metrics,
            units: TaskTracker::new(),
            abort: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[async_trait]
impl Forwarder for SemaphoreForwarder {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "semaphore forwarder started with max_concurrent={}",
            self.max_concurrent
        );
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping semaphore forwarder: waiting for in-flight units");
        self.units.close();

        if timeout(self.shutdown_timeout, self.units.wait())
            .await
            .is_err()
        {
            warn!(
                "semaphore forwarder stop timed out after {:?}",
                self.shutdown_timeout
            );
            // Units still waiting for a token give up instead of starting new
            // sends after stop has returned.
            self.abort.cancel();
        } else {
            info!("semaphore forwarder stopped: all units finished");
        }
    }

    fn submit(&self, task: ForwardingTask) -> Result<(), SubmitError> {
        if self.stopped.load(Ordering::SeqCst) {
            // Silent drop: during shutdown the readiness gate blocks traffic.
            debug!("semaphore forwarder stopped, dropping task");
            return Ok(());
        }

        let tokens = Arc::clone(&self.tokens);
        let waiters = Arc::clone(&self.waiters);
        let sender = Arc::clone(&self.sender);
        let metrics = Arc::clone(&self.metrics);
        let abort = self.abort.clone();

        self.units.spawn(async move {
            waiters.fetch_add(1, Ordering::SeqCst);
            let acquired = tokio::select! {
                permit = tokens.acquire_owned() => permit.ok(),
                () = abort.cancelled() => None,
            };
            waiters.fetch_sub(1, Ordering::SeqCst);

            match acquired {
                Some(permit) => {
                    sender.send(task).await;
                    drop(permit);
                }
                None => {
                    // Abandoned on shutdown timeout before ever reaching the wire.
                    metrics.jobs_failed.inc();
                }
            }
        });

        Ok(())
    }

    fn queue_depth(&self) -> usize {
        self.waiters.load(Ordering::SeqCst).max(0) as usize
    }
}
