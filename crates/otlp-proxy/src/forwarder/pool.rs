//! Pooled forwarder: a fixed worker set plus a bounded FIFO queue.
//!
//! Admission is gated by a single counting permit sized to
//! `workers + queue_capacity`. A submit either takes a permit immediately or
//! is rejected, so queued + in-flight never exceeds total capacity and
//! rejection is deterministic at the saturation point, not probabilistic
//! under contention. Each worker holds its task's permit until the send
//! finishes.

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

pub struct PoolForwarder {
    worker_count: usize,
    queue_capacity: usize,
    /// Counts queued + in-flight tasks; gates acceptance.
    permits: Arc<Semaphore>,
    queue_tx: async_channel::Sender<QueuedTask>,
    queue_rx: async_channel::Receiver<QueuedTask>,
    sender: Arc<UpstreamSender>,
    metrics: Arc<Metrics>,
    workers: TaskTracker,
    abort: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_timeout: Duration,
}

impl PoolForwarder {
    /// Creates a pool. `worker_pool_size <= 0` auto-sizes to 50 x CPU count
    /// (forwarding is I/O-bound, so workers far outnumber cores);
    /// `job_queue_size <= 0` falls back to 10 000.
    pub fn new(
        worker_pool_size: i64,
        job_queue_size: i64,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> PoolForwarder {
        let worker_count = if worker_pool_size <= 0 {
            let auto = 50 * num_cpus::get();
            info!("worker pool size not configured, using default: {auto} (50 x CPU count)");
            auto
        } else {
            worker_pool_size as usize
        };

        let queue_capacity = if job_queue_size <= 0 {
            info!("job queue size not configured, using default: {DEFAULT_QUEUE_CAPACITY}");
            DEFAULT_QUEUE_CAPACITY
        } else {
            job_queue_size as usize
        };

        // The channel itself is unbounded; the permit set is what bounds it.
        let (queue_tx, queue_rx) = async_channel::unbounded();

        PoolForwarder {
            worker_count,
            queue_capacity,
            permits: Arc::new(Semaphore::new(worker_count + queue_capacity)),
            queue_tx,
            queue_rx,
            sender: Arc::new(UpstreamSender::new(Arc::clone(&metrics), worker_count)),
            metrics,
            workers: TaskTracker::new(),
            abort: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn spawn_worker(&self, id: usize) {
        let queue_rx = self.queue_rx.clone();
        let sender = Arc::clone(&self.sender);
        let abort = self.abort.clone();

        self.workers.spawn(async move {
            debug!("worker {id} started");
            loop {
                tokio::select! {
                    job = queue_rx.recv() => match job {
                        Ok(mut job) => {
                            let Some(task) = job.take() else { continue };
                            sender.send(task).await;
                            // The admission permit rides on the job wrapper and
                            // is released here, after the send has finished.
                            drop(job);
                        }
                        Err(_) => break,
                    },
                    () = abort.cancelled() => break,
                }
            }
            debug!("worker {id} stopped");
        });
    }

    /// Drops every task still sitting in the queue. Their wrappers count them
    /// as failed on drop.
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
impl Forwarder for PoolForwarder {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting worker pool with {} workers", self.worker_count);
        for id in 0..self.worker_count {
            self.spawn_worker(id);
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping worker pool: closing queue and waiting for workers");
        self.queue_tx.close();
        self.workers.close();

        if timeout(self.shutdown_timeout, self.workers.wait())
            .await
            .is_err()
        {
            warn!(
                "worker pool stop timed out after {:?}: abandoning remaining work",
                self.shutdown_timeout
            );
            self.abort.cancel();
            self.discard_queued();
        } else {
            info!("worker pool stopped: all workers finished");
        }
    }

    fn submit(&self, task: ForwardingTask) -> Result<(), SubmitError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SubmitError::Stopped);
        }

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Err(SubmitError::AtCapacity {
                capacity: self.worker_count + self.queue_capacity,
            });
        };

        let job = QueuedTask::new(task, Some(permit), Arc::clone(&self.metrics));
        if let Err(e) = self.queue_tx.try_send(job) {
            // The queue closed under us; the task was never accepted, so take
            // it back out of the wrapper to keep the failure counter honest.
            let mut job = e.into_inner();
            let _ = job.take();
            return Err(SubmitError::Stopped);
        }
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        // A task in rendezvous with an idle worker sits in the channel for a
        // moment even when the queue is logically empty; backlog never exceeds
        // the configured capacity.
        self.queue_rx.len().min(self.queue_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use bytes::Bytes;
    use http::HeaderMap;
    use std::net::SocketAddr;
    use std::time::Instant;

    async fn start_upstream(status: u16, delay: Duration) -> SocketAddr {
        let app = Router::new().route(
            "/v1/traces",
            post(move || async move {
                tokio::time::sleep(delay).await;
                axum::http::StatusCode::from_u16(status).unwrap()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn task_for(addr: SocketAddr) -> ForwardingTask {
        ForwardingTask {
            body: Bytes::from_static(b"payload"),
            target_url: format!("http://{addr}/v1/traces"),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn capacity_bound_is_deterministic() {
        let addr = start_upstream(200, Duration::from_millis(500)).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(1, 1, Duration::from_secs(5), Arc::clone(&metrics));
        pool.start();

        // Capacity is workers + queue = 2: two submits fit, the third rejects.
        pool.submit(task_for(addr)).expect("first submit fits");
        pool.submit(task_for(addr)).expect("second submit fits");
        let err = pool.submit(task_for(addr)).unwrap_err();
        assert!(matches!(err, SubmitError::AtCapacity { capacity: 2 }));

        // Once the first send completes its permit frees up.
        tokio::time::sleep(Duration::from_millis(900)).await;
        pool.submit(task_for(addr)).expect("capacity freed after completion");

        pool.stop().await;
        assert_eq!(metrics.jobs_processed.get(), 3);
    }

    #[tokio::test]
    async fn processes_and_counts_successes() {
        let addr = start_upstream(200, Duration::ZERO).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(2, 10, Duration::from_secs(5), Arc::clone(&metrics));
        pool.start();

        for _ in 0..5 {
            pool.submit(task_for(addr)).unwrap();
        }
        pool.stop().await;

        assert_eq!(metrics.jobs_processed.get(), 5);
        assert_eq!(metrics.jobs_failed.get(), 0);
        assert_eq!(pool.queue_depth(), 0);
    }

    #[tokio::test]
    async fn non_2xx_counts_as_failed() {
        let addr = start_upstream(500, Duration::ZERO).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(1, 10, Duration::from_secs(5), Arc::clone(&metrics));
        pool.start();

        pool.submit(task_for(addr)).unwrap();
        pool.stop().await;

        assert_eq!(metrics.jobs_processed.get(), 0);
        assert_eq!(metrics.jobs_failed.get(), 1);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let addr = start_upstream(200, Duration::ZERO).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(1, 1, Duration::from_secs(5), metrics);
        pool.start();
        pool.stop().await;

        let err = pool.submit(task_for(addr)).unwrap_err();
        assert!(matches!(err, SubmitError::Stopped));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(2, 2, Duration::from_secs(5), metrics);
        pool.start();
        pool.start();
        pool.stop().await;
        pool.stop().await;
        assert_eq!(pool.queue_depth(), 0);
    }

    #[tokio::test]
    async fn stop_times_out_against_a_slow_collector() {
        let addr = start_upstream(200, Duration::from_secs(3)).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(1, 5, Duration::from_secs(1), Arc::clone(&metrics));
        pool.start();

        // One task in flight for 3s, two more stuck in the queue.
        for _ in 0..3 {
            pool.submit(task_for(addr)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        pool.stop().await;
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_secs(2),
            "stop should honor its 1s budget, took {elapsed:?}"
        );

        // The queued tasks never reached a sender and count as failed.
        assert_eq!(metrics.jobs_failed.get(), 2);
        assert_eq!(pool.queue_depth(), 0);
    }

    #[tokio::test]
    async fn auto_sizing_applies_to_non_positive_values() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PoolForwarder::new(0, -1, Duration::from_secs(1), metrics);
        assert_eq!(pool.worker_count(), 50 * num_cpus::get());
        assert_eq!(pool.queue_capacity(), DEFAULT_QUEUE_CAPACITY);
    }
}
