//! Redis queue backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::{AddResult, FailDecision, FailResult, Job, JobCounts, JobOutcome, JobQueue, JobStatus, NewJob};
use crate::config::model::JobOptions;
use crate::error::QueueError;

/// Interval between polls of the waiting list while `next` waits.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// KEYS: job record, wait list. ARGV: job id, job json.
const ADD_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[2], 'NX') then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

// KEYS: job record, active list, finished list. ARGV: job id, job json, keep, job key prefix.
const FINISH_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[2], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
local keep = tonumber(ARGV[3])
local stale = redis.call('LRANGE', KEYS[3], keep, -1)
for _, id in ipairs(stale) do
  redis.call('DEL', ARGV[4] .. id)
end
if keep == 0 then
  redis.call('DEL', KEYS[3])
else
  redis.call('LTRIM', KEYS[3], 0, keep - 1)
end
return #stale
"#;

// KEYS: job record, active list, delayed set. ARGV: job id, job json, due timestamp in ms.
const DELAY_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[2], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: delayed set, wait list. ARGV: now in ms.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return #due
"#;

// KEYS: wait list. ARGV: job key prefix.
const CLEAR_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

// KEYS: job record, failed list, wait list. ARGV: job id, reset job json.
const RETRY_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
if redis.call('LREM', KEYS[2], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('RPUSH', KEYS[3], ARGV[1])
return 1
"#;

// KEYS: worker claim. ARGV: token, ttl in ms.
const CLAIM_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder and holder ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

// KEYS: worker claim. ARGV: token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Key layout of one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(queue_name: &str) -> Self {
        Self {
            prefix: queue_name.to_string(),
        }
    }

    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn wait(&self) -> String {
        format!("{}:wait", self.prefix)
    }

    pub fn active(&self, consumer: &str) -> String {
        format!("{}:active:{}", self.prefix, consumer)
    }

    /// Set of consumer names that have pulled from this queue.
    pub fn consumers(&self) -> String {
        format!("{}:consumers", self.prefix)
    }

    /// Claim held by the running instance of a named worker.
    pub fn worker(&self, name: &str) -> String {
        format!("{}:worker:{}", self.prefix, name)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    pub fn completed(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }
}

/// [`JobQueue`] backed by Redis lists, one record key per job.
#[derive(Clone)]
pub struct RedisQueue {
    connection: ConnectionManager,
    keys: QueueKeys,
    options: JobOptions,
}

impl RedisQueue {
    /// Connects to Redis and binds to the named queue.
    pub async fn connect(redis_url: &str, queue_name: &str, options: JobOptions) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: redis_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            connection,
            keys: QueueKeys::new(queue_name),
            options,
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn
            .get(self.keys.job(job_id))
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        json.map(|j| decode(&j)).transpose()
    }

    async fn put_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(self.keys.job(&job.id), encode(job)?)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))
    }

    async fn active_keys(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.connection.clone();
        let consumers: Vec<String> = conn
            .smembers(self.keys.consumers())
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        Ok(consumers.iter().map(|c| self.keys.active(c)).collect())
    }

    /// Moves one waiting id to the consumer's active list, if any is waiting.
    async fn claim(&self, consumer: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection.clone();
        redis::cmd("LMOVE")
            .arg(self.keys.wait())
            .arg(self.keys.active(consumer))
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))
    }

    async fn release(
        &self,
        script: &str,
        consumer: &str,
        job: &Job,
        target: String,
        extra: String,
        prefix: Option<String>,
    ) -> Result<i64, QueueError> {
        let mut conn = self.connection.clone();
        let script = Script::new(script);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.keys.job(&job.id))
            .key(self.keys.active(consumer))
            .key(target)
            .arg(&job.id)
            .arg(encode(job)?)
            .arg(extra);
        if let Some(prefix) = prefix {
            invocation.arg(prefix);
        }

        let released: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

        if released < 0 {
            return Err(QueueError::InvalidState {
                job_id: job.id.clone(),
                expected: JobStatus::Active.as_str().to_string(),
            });
        }
        Ok(released)
    }

    async fn finish(&self, consumer: &str, job: &Job, list: String, keep: usize) -> Result<(), QueueError> {
        let trimmed = self
            .release(
                FINISH_SCRIPT,
                consumer,
                job,
                list,
                keep.to_string(),
                Some(self.keys.job_prefix()),
            )
            .await?;
        if trimmed > 0 {
            debug!(trimmed, "Trimmed finished jobs past retention");
        }
        Ok(())
    }

    async fn ids(&self, status: JobStatus, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = limit as isize - 1;
        let mut conn = self.connection.clone();

        let ids = match status {
            JobStatus::Waiting => conn.lrange(self.keys.wait(), 0, stop).await,
            JobStatus::Delayed => conn.zrange(self.keys.delayed(), 0, stop).await,
            JobStatus::Completed => conn.lrange(self.keys.completed(), 0, stop).await,
            JobStatus::Failed => conn.lrange(self.keys.failed(), 0, stop).await,
            JobStatus::Active => {
                let mut ids = Vec::new();
                for key in self.active_keys().await? {
                    let held: Vec<String> = conn
                        .lrange(&key, 0, -1)
                        .await
                        .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;
                    ids.extend(held);
                }
                ids.truncate(limit);
                Ok(ids)
            }
        };

        ids.map_err(|e| QueueError::DequeueFailed(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn add(&self, job: NewJob) -> Result<AddResult, QueueError> {
        let record = Job::new(job, &self.options);
        let mut conn = self.connection.clone();

        let added: i64 = Script::new(ADD_SCRIPT)
            .key(self.keys.job(&record.id))
            .key(self.keys.wait())
            .arg(&record.id)
            .arg(encode(&record)?)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::EnqueueFailed(e.to_string()))?;

        Ok(if added == 1 {
            AddResult::Added
        } else {
            AddResult::Duplicate
        })
    }

    async fn next(&self, consumer: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(self.keys.consumers(), consumer)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        loop {
            if let Some(id) = self.claim(consumer).await? {
                match self.get_job(&id).await? {
                    Some(mut job) => {
                        job.start();
                        self.put_job(&job).await?;
                        return Ok(Some(job));
                    }
                    None => {
                        warn!(job_id = %id, "Dropping queued id without a job record");
                        conn.lrem::<_, _, ()>(self.keys.active(consumer), 1, &id)
                            .await
                            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;
                        continue;
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, consumer: &str, job: &Job, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut job = job.clone();
        job.complete(outcome);
        self.finish(consumer, &job, self.keys.completed(), self.options.keep_completed)
            .await
    }

    async fn fail(&self, consumer: &str, job: &Job, reason: &str) -> Result<FailResult, QueueError> {
        let mut job = job.clone();

        match job.fail(reason) {
            FailDecision::Retry { delay } => {
                let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                self.release(
                    DELAY_SCRIPT,
                    consumer,
                    &job,
                    self.keys.delayed(),
                    due.to_string(),
                    None,
                )
                .await?;
                Ok(FailResult::Retrying { delay })
            }
            FailDecision::Fail => {
                self.finish(consumer, &job, self.keys.failed(), self.options.keep_failed)
                    .await?;
                Ok(FailResult::Failed)
            }
        }
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let mut recovered = 0;

        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(self.keys.active(consumer))
                .arg(self.keys.wait())
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

            match moved {
                Some(id) => {
                    debug!(job_id = %id, consumer, "Recovered unacknowledged job");
                    recovered += 1;
                }
                None => return Ok(recovered),
            }
        }
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let promoted: usize = Script::new(PROMOTE_SCRIPT)
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;
        Ok(promoted)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let active_keys = self.active_keys().await?;
        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.llen(self.keys.wait())
            .zcard(self.keys.delayed())
            .llen(self.keys.completed())
            .llen(self.keys.failed());
        for key in &active_keys {
            pipe.llen(key);
        }

        let lengths: Vec<usize> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        match lengths.as_slice() {
            [waiting, delayed, completed, failed, active @ ..] => Ok(JobCounts {
                waiting: *waiting,
                active: active.iter().sum(),
                delayed: *delayed,
                completed: *completed,
                failed: *failed,
            }),
            _ => Err(QueueError::DequeueFailed(
                "unexpected reply to queue length pipeline".to_string(),
            )),
        }
    }

    async fn list(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        for id in self.ids(status, limit).await? {
            // The containing list is authoritative; delayed jobs promoted to
            // the waiting list still carry the delayed status in their record.
            if let Some(mut job) = self.get_job(&id).await? {
                job.status = status;
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn clear_waiting(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let cleared: usize = Script::new(CLEAR_SCRIPT)
            .key(self.keys.wait())
            .arg(self.keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;
        Ok(cleared)
    }

    async fn retry_failed(&self, job_id: &str) -> Result<(), QueueError> {
        let mut job = self.get_job(job_id).await?.ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        job.reset_for_retry();

        let mut conn = self.connection.clone();
        let moved: i64 = Script::new(RETRY_SCRIPT)
            .key(self.keys.job(job_id))
            .key(self.keys.failed())
            .key(self.keys.wait())
            .arg(job_id)
            .arg(encode(&job)?)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;

        retry_result(job_id, moved)
    }

    async fn claim_worker(&self, worker: &str, token: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.connection.clone();
        let claimed: i64 = Script::new(CLAIM_SCRIPT)
            .key(self.keys.worker(worker))
            .arg(token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;
        Ok(claimed == 1)
    }

    async fn release_worker(&self, worker: &str, token: &str) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.keys.worker(worker))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::UpdateFailed(e.to_string()))?;
        Ok(())
    }
}

/// Maps the retry script's reply onto the queue contract.
fn retry_result(job_id: &str, moved: i64) -> Result<(), QueueError> {
    match moved {
        1 => Ok(()),
        0 => Err(QueueError::JobNotFound {
            job_id: job_id.to_string(),
        }),
        _ => Err(QueueError::InvalidState {
            job_id: job_id.to_string(),
            expected: JobStatus::Failed.as_str().to_string(),
        }),
    }
}

fn encode(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::SerializationFailed(e.to_string()))
}

fn decode(json: &str) -> Result<Job, QueueError> {
    serde_json::from_str(json).map_err(|e| QueueError::SerializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = QueueKeys::new("video-storage");
        assert_eq!(keys.job("video-0"), "video-storage:job:video-0");
        assert_eq!(keys.wait(), "video-storage:wait");
        assert_eq!(keys.active("worker-1"), "video-storage:active:worker-1");
        assert_eq!(keys.consumers(), "video-storage:consumers");
        assert_eq!(keys.worker("host-a"), "video-storage:worker:host-a");
        assert_eq!(keys.delayed(), "video-storage:delayed");
        assert_eq!(keys.completed(), "video-storage:completed");
        assert_eq!(keys.failed(), "video-storage:failed");
        assert!(keys.job("x").starts_with(&keys.job_prefix()));
    }

    #[test]
    fn job_record_roundtrips_through_json() {
        let mut job = Job::new(NewJob::for_listing_position(4, "https://src/e.mp4"), &JobOptions::default());
        job.start();

        let decoded = decode(&encode(&job).unwrap()).unwrap();

        assert_eq!(decoded.id, "video-4");
        assert_eq!(decoded.file_url(), "https://src/e.mp4");
        assert_eq!(decoded.attempts_made, 1);
        assert_eq!(decoded.status, JobStatus::Active);
    }

    #[test]
    fn retry_reply_maps_to_contract() {
        assert!(retry_result("video-0", 1).is_ok());
        assert!(matches!(
            retry_result("video-0", 0),
            Err(QueueError::JobNotFound { .. })
        ));
        assert!(matches!(
            retry_result("video-0", -1),
            Err(QueueError::InvalidState { expected, .. }) if expected == "failed"
        ));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn retry_failed_moves_job_back_atomically() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let name = format!("retry-test-{}", std::process::id());
        let options = JobOptions {
            attempts: 1,
            ..JobOptions::default()
        };
        let queue = RedisQueue::connect(&url, &name, options).await.unwrap();
        queue.clear_waiting().await.unwrap();

        queue.add(NewJob::for_listing_position(0, "https://src/a.mp4")).await.unwrap();
        let job = queue.next("w-0", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(queue.fail("w-0", &job, "boom").await.unwrap(), FailResult::Failed);

        queue.retry_failed("video-0").await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.failed, counts.waiting), (0, 1));
        let waiting = queue.list(JobStatus::Waiting, 10).await.unwrap();
        assert_eq!(waiting[0].attempts_made, 0);
        assert!(waiting[0].failed_reason.is_none());

        assert!(matches!(
            queue.retry_failed("video-0").await,
            Err(QueueError::InvalidState { .. })
        ));
        queue.clear_waiting().await.unwrap();
    }

    #[test]
    fn corrupt_record_is_serialization_error() {
        assert!(matches!(decode("{not json"), Err(QueueError::SerializationFailed(_))));
    }
}
