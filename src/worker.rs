//! Queue consumer: slots pulling jobs into the pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::model::{QueueConfig, WorkerConfig};
use crate::error::{AppError, QueueError};
use crate::metrics::Metrics;
use crate::pipeline::{scratch, Pipeline};
use crate::queue::{FailResult, Job, JobQueue};

/// Pause after a queue error before a slot polls again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Lifetime of the claim on the worker name; renewed every third of it.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Drains a [`JobQueue`] into a [`Pipeline`] with a fixed number of slots.
///
/// Slot `n` pulls as consumer `<name>-<n>`, so a restarted worker with the
/// same name recovers exactly the jobs its previous run left unacknowledged.
/// The name is claimed in the queue for as long as the worker runs; a second
/// live instance with the same name refuses to start instead of recovering
/// jobs that are still in flight. Scratch files live under
/// `<scratch_root>/<name>/`.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    name: String,
    token: String,
    lease_ttl: Duration,
    concurrency: usize,
    poll_timeout: Duration,
    promote_interval: Duration,
    sweep_scratch: bool,
    metrics: Option<Arc<Metrics>>,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: Arc<Pipeline>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            queue,
            pipeline: Arc::new(pipeline.for_worker(&name)),
            name,
            token: Uuid::new_v4().to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            concurrency: 1,
            poll_timeout: Duration::from_secs(5),
            promote_interval: Duration::from_secs(1),
            sweep_scratch: false,
            metrics: None,
        }
    }

    pub fn from_config(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<Pipeline>,
        worker: &WorkerConfig,
        queue_config: &QueueConfig,
    ) -> Self {
        Self::new(queue, pipeline, worker.name.clone())
            .with_concurrency(worker.concurrency)
            .with_poll_timeout(queue_config.poll_timeout())
            .with_scratch_sweep(worker.sweep_scratch_on_start)
    }

    pub fn with_concurrency(mut self, slots: usize) -> Self {
        self.concurrency = slots.max(1);
        self
    }

    /// Longest a slot waits on an empty queue before re-checking for shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    /// Clears the scratch directory before the first job.
    pub fn with_scratch_sweep(mut self, sweep: bool) -> Self {
        self.sweep_scratch = sweep;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How long the name claim outlives a worker that died without releasing it.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl.max(Duration::from_millis(3));
        self
    }

    pub fn scratch_root(&self) -> &Path {
        self.pipeline.scratch_root()
    }

    fn consumer(&self, slot: usize) -> String {
        format!("{}-{}", self.name, slot)
    }

    /// Runs until `shutdown` flips to true, then waits for in-flight jobs.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        info!(
            worker = %self.name,
            concurrency = self.concurrency,
            scratch = %self.scratch_root().display(),
            "Starting worker"
        );

        if !self.queue.claim_worker(&self.name, &self.token, self.lease_ttl).await? {
            return Err(QueueError::WorkerNameInUse {
                name: self.name.clone(),
            }
            .into());
        }

        let result = self.run_claimed(shutdown).await;

        if let Err(e) = self.queue.release_worker(&self.name, &self.token).await {
            warn!(worker = %self.name, error = %e, "Failed to release worker name");
        }
        result
    }

    async fn run_claimed(&self, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        for slot in 0..self.concurrency {
            let consumer = self.consumer(slot);
            let recovered = self.queue.recover(&consumer).await?;
            if recovered > 0 {
                warn!(consumer = %consumer, recovered, "Requeued jobs left unacknowledged by a previous run");
            }
        }

        if self.sweep_scratch {
            let root = self.scratch_root().to_path_buf();
            let swept = tokio::task::spawn_blocking(move || scratch::sweep(&root))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
            if swept > 0 {
                info!(swept, "Removed leftover scratch entries");
            }
        }

        let mut tasks = JoinSet::new();
        for slot in 0..self.concurrency {
            let consumer = self.consumer(slot);
            tasks.spawn(run_slot(
                self.queue.clone(),
                self.pipeline.clone(),
                consumer,
                self.poll_timeout,
                shutdown.clone(),
            ));
        }
        tasks.spawn(run_promoter(
            self.queue.clone(),
            self.metrics.clone(),
            self.promote_interval,
            shutdown.clone(),
        ));
        tasks.spawn(run_heartbeat(
            self.queue.clone(),
            self.name.clone(),
            self.token.clone(),
            self.lease_ttl,
            shutdown.clone(),
        ));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!(worker = %self.name, "Worker stopped");
        Ok(())
    }
}

async fn run_slot(
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    consumer: String,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(consumer = %consumer, "Slot started");

    while !*shutdown.borrow() {
        let next = tokio::select! {
            next = queue.next(&consumer, poll_timeout) => next,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match next {
            Ok(Some(job)) => handle(queue.as_ref(), &pipeline, &consumer, job).await,
            Ok(None) => tokio::task::yield_now().await,
            Err(e) => {
                error!(consumer = %consumer, error = %e, "Failed to fetch next job");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    debug!(consumer = %consumer, "Slot stopped");
}

/// Runs one delivery and acknowledges it.
async fn handle(queue: &dyn JobQueue, pipeline: &Pipeline, consumer: &str, job: Job) {
    match pipeline.process(&job).await {
        Ok(outcome) => {
            if let Err(e) = queue.complete(consumer, &job, outcome).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
        Err(e) => match queue.fail(consumer, &job, &e.to_string()).await {
            Ok(FailResult::Retrying { delay }) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job will be redelivered"
                );
            }
            Ok(FailResult::Failed) => {
                error!(job_id = %job.id, attempts = job.attempts_made, "Job failed permanently");
            }
            Err(qe) => {
                error!(job_id = %job.id, error = %qe, "Failed to report job failure");
            }
        },
    }
}

async fn run_promoter(
    queue: Arc<dyn JobQueue>,
    metrics: Option<Arc<Metrics>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match queue.promote_delayed().await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "Promoted delayed jobs"),
            Err(e) => warn!(error = %e, "Failed to promote delayed jobs"),
        }

        if let Some(m) = &metrics {
            match queue.counts().await {
                Ok(counts) => m.set_queue_depth(&counts),
                Err(e) => debug!(error = %e, "Failed to read queue counts"),
            }
        }
    }
}

/// Keeps the worker name claimed while the worker runs.
async fn run_heartbeat(
    queue: Arc<dyn JobQueue>,
    name: String,
    token: String,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(ttl / 3);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match queue.claim_worker(&name, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => error!(worker = %name, "Worker name was claimed by another instance"),
            Err(e) => warn!(worker = %name, error = %e, "Failed to renew worker name claim"),
        }
    }
}
