//! In-process queue backend.
//!
//! Jobs live only as long as the process. Used by single-process runs and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{AddResult, FailDecision, FailResult, Job, JobCounts, JobOutcome, JobQueue, JobStatus, NewJob};
use crate::config::model::JobOptions;
use crate::error::QueueError;

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: VecDeque<String>,
    active: HashMap<String, Vec<String>>,
    delayed: Vec<(DateTime<Utc>, String)>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    /// Worker name claims: token and expiry.
    workers: HashMap<String, (String, Instant)>,
}

impl QueueState {
    fn take_waiting(&mut self, consumer: &str) -> Option<Job> {
        while let Some(id) = self.waiting.pop_front() {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.start();
            let job = job.clone();
            self.active.entry(consumer.to_string()).or_default().push(id);
            return Some(job);
        }
        None
    }

    fn release_active(&mut self, consumer: &str, job_id: &str) -> Result<&mut Job, QueueError> {
        let held = self
            .active
            .get_mut(consumer)
            .and_then(|ids| ids.iter().position(|id| id == job_id).map(|i| ids.remove(i)))
            .is_some();

        if !held {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                expected: JobStatus::Active.as_str().to_string(),
            });
        }

        self.jobs.get_mut(job_id).ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.to_string(),
        })
    }

    /// Files a finished job and forgets the oldest ones beyond `keep`.
    fn finish(&mut self, status: JobStatus, job_id: &str, keep: usize) {
        let list = match status {
            JobStatus::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        list.push_front(job_id.to_string());

        let mut dropped = Vec::new();
        while list.len() > keep {
            if let Some(id) = list.pop_back() {
                dropped.push(id);
            }
        }
        for id in dropped {
            self.jobs.remove(&id);
        }
    }

    fn ids(&self, status: JobStatus) -> Vec<&String> {
        match status {
            JobStatus::Waiting => self.waiting.iter().collect(),
            JobStatus::Active => self.active.values().flatten().collect(),
            JobStatus::Delayed => self.delayed.iter().map(|(_, id)| id).collect(),
            JobStatus::Completed => self.completed.iter().collect(),
            JobStatus::Failed => self.failed.iter().collect(),
        }
    }
}

/// [`JobQueue`] kept entirely in memory.
#[derive(Debug)]
pub struct MemoryQueue {
    options: JobOptions,
    state: Mutex<QueueState>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new(options: JobOptions) -> Self {
        Self {
            options,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn add(&self, job: NewJob) -> Result<AddResult, QueueError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Ok(AddResult::Duplicate);
        }

        let id = job.id.clone();
        state.jobs.insert(id.clone(), Job::new(job, &self.options));
        state.waiting.push_back(id);
        drop(state);

        self.available.notify_one();
        Ok(AddResult::Added)
    }

    async fn next(&self, consumer: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(job) = self.state.lock().await.take_waiting(consumer) {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, consumer: &str, job: &Job, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.release_active(consumer, &job.id)?.complete(outcome);
        state.finish(JobStatus::Completed, &job.id, self.options.keep_completed);
        Ok(())
    }

    async fn fail(&self, consumer: &str, job: &Job, reason: &str) -> Result<FailResult, QueueError> {
        let mut state = self.state.lock().await;
        let decision = state.release_active(consumer, &job.id)?.fail(reason);

        match decision {
            FailDecision::Retry { delay } => {
                let due = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                state.delayed.push((due, job.id.clone()));
                Ok(FailResult::Retrying { delay })
            }
            FailDecision::Fail => {
                state.finish(JobStatus::Failed, &job.id, self.options.keep_failed);
                Ok(FailResult::Failed)
            }
        }
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let ids = state.active.remove(consumer).unwrap_or_default();

        for id in ids.iter().rev() {
            if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Waiting;
            }
            state.waiting.push_front(id.clone());
        }
        drop(state);

        for _ in &ids {
            self.available.notify_one();
        }
        Ok(ids.len())
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let (mut due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.delayed).into_iter().partition(|(at, _)| *at <= now);
        state.delayed = pending;
        due.sort_by_key(|(at, _)| *at);

        for (_, id) in &due {
            if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Waiting;
            }
            state.waiting.push_back(id.clone());
        }
        drop(state);

        for _ in &due {
            self.available.notify_one();
        }
        Ok(due.len())
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(JobCounts {
            waiting: state.waiting.len(),
            active: state.active.values().map(Vec::len).sum(),
            delayed: state.delayed.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn list(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .ids(status)
            .into_iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn clear_waiting(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.waiting.drain(..).collect();
        for id in &ids {
            state.jobs.remove(id);
        }
        Ok(ids.len())
    }

    async fn retry_failed(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        let Some(pos) = state.failed.iter().position(|id| id == job_id) else {
            return Err(if state.jobs.contains_key(job_id) {
                QueueError::InvalidState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Failed.as_str().to_string(),
                }
            } else {
                QueueError::JobNotFound {
                    job_id: job_id.to_string(),
                }
            });
        };
        state.failed.remove(pos);

        let job = state.jobs.get_mut(job_id).ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        job.reset_for_retry();
        state.waiting.push_back(job_id.to_string());
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    async fn claim_worker(&self, worker: &str, token: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((holder, expires)) = state.workers.get(worker) {
            if holder != token && *expires > now {
                return Ok(false);
            }
        }
        state
            .workers
            .insert(worker.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_worker(&self, worker: &str, token: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.workers.get(worker).is_some_and(|(holder, _)| holder == token) {
            state.workers.remove(worker);
        }
        Ok(())
    }
}
