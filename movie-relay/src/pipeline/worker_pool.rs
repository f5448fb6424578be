//! Worker pool that runs admitted jobs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::{AdmissionController, QueueDepthStatus};
use super::runner::JobRunner;

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval of the queue status log line.
    #[serde(default = "default_queue_log_interval_secs")]
    pub queue_log_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_queue_log_interval_secs() -> u64 {
    300
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            queue_log_interval_secs: default_queue_log_interval_secs(),
        }
    }
}

/// A worker pool for processing jobs.
///
/// Each worker owns one job from dispatch until it is terminal. The pool
/// runs one worker per active slot so every admitted job has a worker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: usize,
    busy_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, workers: usize) -> Self {
        Self {
            config,
            workers: workers.max(1),
            busy_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the workers and the queue status logger.
    pub fn start(&self, admission: Arc<AdmissionController>, runner: Arc<JobRunner>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        info!("Starting worker pool with {} workers", self.workers);

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped");
            return;
        };

        for i in 0..self.workers {
            let cancellation_token = self.cancellation_token.clone();
            let admission = admission.clone();
            let runner = runner.clone();
            let notifier = admission.notifier();
            let busy = self.busy_workers.clone();

            join_set.spawn(async move {
                debug!("Worker {} started", i);

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = notifier.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }

                    while let Some(job) = admission.store().take_dispatch() {
                        let job_id = job.id.clone();
                        debug!("Worker {} picked up job {}", i, job_id);
                        busy.fetch_add(1, Ordering::SeqCst);
                        tokio::select! {
                            _ = runner.run(job) => {}
                            _ = cancellation_token.cancelled() => {
                                warn!("Worker {} interrupted by shutdown while running job {}", i, job_id);
                            }
                        }
                        busy.fetch_sub(1, Ordering::SeqCst);
                        if cancellation_token.is_cancelled() {
                            break;
                        }
                    }
                }

                debug!("Worker {} shutting down", i);
            });
        }

        let cancellation_token = self.cancellation_token.clone();
        let log_every = Duration::from_secs(self.config.queue_log_interval_secs.max(1));
        join_set.spawn(async move {
            let mut ticker = interval(log_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = admission.stats();
                        match stats.depth_status {
                            QueueDepthStatus::Normal => info!(
                                queued = stats.queued,
                                active = stats.active,
                                max_active = stats.max_active,
                                "Queue status"
                            ),
                            status => warn!(
                                queued = stats.queued,
                                active = stats.active,
                                max_active = stats.max_active,
                                ?status,
                                "Queue depth above threshold"
                            ),
                        }
                    }
                }
            }
        });
    }

    /// Stop the worker pool.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Workers currently running a job.
    pub fn busy_count(&self) -> usize {
        self.busy_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
