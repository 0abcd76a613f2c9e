//! Hybrid forwarder: bounded queue, a few dispatchers, detached senders.
//!
//! The bounded queue gives fast, deterministic backpressure at the ingress
//! (enqueue-or-reject). A small number of dispatchers pull from the queue,
//! acquire one of `max_concurrent` HTTP-concurrency tokens, and spawn a
//! detached sender for the actual POST, immediately returning to the queue so
//! a slow collector cannot stall dispatch. Shutdown waits on both the
//! dispatchers and the detached senders, up to the shutdown timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::forwarder::{Forwarder, ForwardingTask, QueuedTask, SubmitError};
use crate::metrics::Metrics;
use crate::sender::UpstreamSender;

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_MAX_CONCURRENT: usize = 10_000;

pub struct HybridForwarder {
    dispatcher_count: usize,
    queue_capacity: usize,
    max_concurrent: usize,
    queue_tx: async_channel::Sender<QueuedTask>,
    queue_rx: async_channel::Receiver<QueuedTask>,
    /// Gates in-flight HTTP requests; dispatchers block here, not senders.
    tokens: Arc<Semaphore>,
    sender: Arc<UpstreamSender>,
    metrics: Arc<Metrics>,
    dispatchers: TaskTracker,
    sends: TaskTracker,
    abort: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_timeout: Duration,
}

impl HybridForwarder {
    pub fn new(
        worker_pool_size: i64,
        job_queue_size: i64,
        max_concurrent: i64,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> HybridForwarder {
        let dispatcher_count = if worker_pool_size <= 0 {
            1
        } else {
            worker_pool_size as usize
        };
        let queue_capacity = if job_queue_size <= 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            job_queue_size as usize
        };
        let max_concurrent = if max_concurrent <= 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent as usize
        };

        let (queue_tx, queue_rx) = async_channel::bounded(queue_capacity);

        HybridForwarder {
            dispatcher_count,
            queue_capacity,
            max_concurrent,
            queue_tx,
            queue_rx,
            tokens: Arc::new(Semaphore::new(max_concurrent)),
            sender: Arc::new(UpstreamSender::new(Arc::clone(&metrics), max_concurrent)),
            metrics,
            dispatchers: TaskTracker::new(),
            sends: TaskTracker::new(),
            abort: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    pub fn dispatcher_count(&self) -> usize {
        self.dispatcher_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn spawn_dispatcher(&self, id: usize) {
        let queue_rx = self.queue_rx.clone();
        let tokens = Arc::clone(&self.tokens);
        let sender = Arc::clone(&self.sender);
        let sends = self.sends.clone();
        let abort = self.abort.clone();

        self.dispatchers.spawn(async move {
            debug!("dispatcher {id} started");
            loop {
                let mut job = tokio::select! {
                    job = queue_rx.recv() => match job {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                    () = abort.cancelled() => break,
                };

                // The job wrapper stays alive across the token wait; if the
                // dispatcher is aborted here, dropping it counts the task as
                // failed.
                let permit = tokio::select! {
                    permit = Arc::clone(&tokens).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    () = abort.cancelled() => break,
                };

                let Some(task) = job.take() else { continue };
                drop(job);

                // Detach the send so a slow collector cannot stall dispatch.
                let sender = Arc::clone(&sender);
                sends.spawn(async move {
                    sender.send(task).await;
                    drop(permit);
                });
            }
            debug!("dispatcher {id} stopped");
        });
    }

    fn discard_queued(&self) {
        let mut discarded = 0usize;
        while self.queue_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("discarded {discarded} queued tasks on shutdown timeout");
        }
    }
}

#[async_trait]
impl Forwarder for HybridForwarder {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "starting hybrid forwarder: dispatchers={}, queue_capacity={}, max_concurrent={}",
            self.dispatcher_count, self.queue_capacity, self.max_concurrent
        );
        for id in 0..self.dispatcher_count {
            self.spawn_dispatcher(id);
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping hybrid forwarder: closing queue and waiting for dispatchers and sends");
        self.queue_tx.close();
        self.dispatchers.close();
        self.sends.close();

        let drained = timeout(self.shutdown_timeout, async {
            self.dispatchers.wait().await;
            self.sends.wait().await;
        })
        .await;

        if drained.is_err() {
            warn!(
                "hybrid forwarder stop timed out after {:?}: abandoning remaining work",
                self.shutdown_timeout
            );
            self.abort.cancel();
            self.discard_queued();
        } else {
            info!("hybrid forwarder stopped: dispatchers and in-flight sends finished");
        }
    }

    fn submit(&self, task: ForwardingTask) -> Result<(), SubmitError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SubmitError::Stopped);
        }

        let job = QueuedTask::new(task, None, Arc::clone(&self.metrics));
        match self.queue_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(mut job)) => {
                let _ = job.take();
                Err(SubmitError::AtCapacity {
                    capacity: self.queue_capacity,
                })
            }
            Err(async_channel::TrySendError::Closed(mut job)) => {
                let _ = job.take();
                Err(SubmitError::Stopped)
            }
        }
    }

    fn queue_depth(&self) -> usize {
        self.queue_rx.len()
    }
}
