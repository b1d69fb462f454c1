//! Job queue contract and its Redis and in-memory backends.

pub mod job;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::model::{AppConfig, QueueBackend};
use crate::error::QueueError;

pub use job::{FailDecision, Job, JobOutcome, JobPayload, JobStatus, NewJob, JOB_NAME};
pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Result of submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    /// A job with the same id is already known to the queue; nothing changed.
    Duplicate,
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailResult {
    /// The job will be delivered again once `delay` has passed.
    Retrying { delay: Duration },
    /// Attempts are spent; the job is parked in the failed set.
    Failed,
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Active => self.active,
            JobStatus::Delayed => self.delayed,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }
}

/// Durable, at-least-once job delivery.
///
/// Consumers identify themselves by name. A job handed out by [`next`] stays
/// in that consumer's active set until it is completed or failed, and
/// [`recover`] returns whatever a crashed consumer left behind to the
/// waiting list. A worker holds a [`claim_worker`] lease on its name while
/// it runs, so two live instances never share consumers.
///
/// [`next`]: JobQueue::next
/// [`recover`]: JobQueue::recover
/// [`claim_worker`]: JobQueue::claim_worker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job unless one with the same id is already known.
    async fn add(&self, job: NewJob) -> Result<AddResult, QueueError>;

    /// Takes the next waiting job, waiting up to `timeout` for one to arrive.
    async fn next(&self, consumer: &str, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Acknowledges a delivery as finished.
    async fn complete(&self, consumer: &str, job: &Job, outcome: JobOutcome) -> Result<(), QueueError>;

    /// Reports a delivery as failed, engaging the job's attempts and backoff.
    async fn fail(&self, consumer: &str, job: &Job, reason: &str) -> Result<FailResult, QueueError>;

    /// Moves a consumer's unacknowledged jobs back to the front of the waiting list.
    async fn recover(&self, consumer: &str) -> Result<usize, QueueError>;

    /// Moves delayed jobs whose backoff has elapsed back to the waiting list.
    async fn promote_delayed(&self) -> Result<usize, QueueError>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;

    /// Lists up to `limit` jobs in the given state.
    async fn list(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Drops every waiting job, forgetting its id.
    async fn clear_waiting(&self) -> Result<usize, QueueError>;

    /// Moves a failed job back to the waiting list with a fresh attempt budget.
    async fn retry_failed(&self, job_id: &str) -> Result<(), QueueError>;

    /// Claims `worker` for the instance identified by `token` for `ttl`.
    ///
    /// Returns false while a different token holds an unexpired claim.
    /// Claiming again with the held token extends it.
    async fn claim_worker(&self, worker: &str, token: &str, ttl: Duration) -> Result<bool, QueueError>;

    /// Drops the claim on `worker` if `token` still holds it.
    async fn release_worker(&self, worker: &str, token: &str) -> Result<(), QueueError>;
}

/// Opens the queue backend selected in the config.
pub async fn open(config: &AppConfig) -> Result<Arc<dyn JobQueue>, QueueError> {
    let queue = &config.queue;
    match queue.backend {
        QueueBackend::Redis => {
            let redis = RedisQueue::connect(
                &config.global.redis.url(),
                &queue.name,
                queue.default_job_options,
            )
            .await?;
            Ok(Arc::new(redis))
        }
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(
            queue.default_job_options,
        ))),
    }
}
