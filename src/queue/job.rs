//! Compression job records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::model::JobOptions;
use crate::retry::Stage;

/// Name carried by every job record.
pub const JOB_NAME: &str = "process-video";

/// Queue message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Time-limited fetch URL of the source asset.
    #[serde(rename = "fileURL", alias = "fileUrl")]
    pub file_url: String,
}

/// A job as submitted by the enqueuer, before the queue owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub data: JobPayload,
}

impl NewJob {
    /// Builds the job for position `index` of a catalog listing.
    ///
    /// The id depends only on the position, so submitting the same listing
    /// twice collides on every id.
    pub fn for_listing_position(index: usize, file_url: impl Into<String>) -> Self {
        Self {
            id: format!("video-{}", index),
            data: JobPayload {
                file_url: file_url.into(),
            },
        }
    }
}

/// Queue state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be picked up by a worker.
    Waiting,
    /// Held by a worker.
    Active,
    /// Failed delivery waiting out its backoff.
    Delayed,
    /// Finished; see the outcome for what the pipeline did.
    Completed,
    /// Reported failed after exhausting its attempts.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What the pipeline did with a job it finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Compressed artifact is in the destination bucket.
    Uploaded {
        key: String,
        input_bytes: u64,
        output_bytes: u64,
    },
    /// Pipeline failed and the failure was logged instead of reported.
    Failed { stage: Option<Stage>, error: String },
}

impl JobOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, Self::Uploaded { .. })
    }
}

/// A job record as stored by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub status: JobStatus,

    /// Deliveries started so far.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub failed_reason: Option<String>,
    pub outcome: Option<JobOutcome>,
}

/// What the queue does with a delivery reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDecision {
    Retry { delay: Duration },
    Fail,
}

impl Job {
    /// Creates a waiting job record with the queue's default options.
    pub fn new(job: NewJob, options: &JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: job.id,
            name: JOB_NAME.to_string(),
            data: job.data,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts,
            backoff_delay_ms: options.backoff_delay_ms,
            created_at: now,
            updated_at: now,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            outcome: None,
        }
    }

    pub fn file_url(&self) -> &str {
        &self.data.file_url
    }

    /// Marks the job as picked up by a worker.
    pub fn start(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.attempts_made += 1;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the job as finished with the pipeline's outcome.
    pub fn complete(&mut self, outcome: JobOutcome) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.outcome = Some(outcome);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failed delivery and decides between backoff and terminal failure.
    pub fn fail(&mut self, reason: &str) -> FailDecision {
        let now = Utc::now();
        self.failed_reason = Some(reason.to_string());
        self.updated_at = now;

        if self.attempts_made < self.max_attempts {
            self.status = JobStatus::Delayed;
            FailDecision::Retry {
                delay: Duration::from_millis(self.backoff_delay_ms),
            }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            FailDecision::Fail
        }
    }

    /// Puts a failed job back in line with a fresh attempt budget.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Waiting;
        self.attempts_made = 0;
        self.failed_reason = None;
        self.outcome = None;
        self.finished_at = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            ..JobOptions::default()
        }
    }

    #[test]
    fn listing_position_ids() {
        let job = NewJob::for_listing_position(7, "https://src/a.mp4");
        assert_eq!(job.id, "video-7");
        assert_eq!(job.data.file_url, "https://src/a.mp4");
    }

    #[test]
    fn payload_uses_file_url_wire_name() {
        let payload = JobPayload {
            file_url: "https://src/a.mp4".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"fileURL":"https://src/a.mp4"}"#);

        let parsed: JobPayload = serde_json::from_str(r#"{"fileUrl":"x"}"#).unwrap();
        assert_eq!(parsed.file_url, "x");
    }

    #[test]
    fn fail_retries_until_attempts_spent() {
        let mut job = Job::new(NewJob::for_listing_position(0, "u"), &options(2));

        job.start();
        assert_eq!(
            job.fail("boom"),
            FailDecision::Retry {
                delay: Duration::from_millis(5000)
            }
        );
        assert_eq!(job.status, JobStatus::Delayed);

        job.start();
        assert_eq!(job.fail("boom again"), FailDecision::Fail);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some("boom again"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn retry_delay_follows_configured_backoff() {
        let options = JobOptions {
            attempts: 3,
            backoff_delay_ms: 250,
            ..JobOptions::default()
        };
        let mut job = Job::new(NewJob::for_listing_position(0, "u"), &options);

        job.start();
        assert_eq!(
            job.fail("boom"),
            FailDecision::Retry {
                delay: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn reset_clears_failure() {
        let mut job = Job::new(NewJob::for_listing_position(0, "u"), &options(1));
        job.start();
        job.fail("boom");

        job.reset_for_retry();

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.failed_reason.is_none());
    }

    #[test]
    fn outcome_is_tagged() {
        let outcome = JobOutcome::Failed {
            stage: Some(Stage::Transcode),
            error: "exit 1".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"], "failed");
        assert_eq!(json["stage"], "transcode");
    }
}
