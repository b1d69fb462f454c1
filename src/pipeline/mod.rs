//! Per-job download, transcode, upload and cleanup.

pub mod scratch;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::model::{FailureMode, StageRetries};
use crate::error::{JobError, TranscodeError};
use crate::metrics::Metrics;
use crate::queue::{Job, JobOutcome};
use crate::retry::{run_with_retry, Stage};
use crate::storage::{redact_url, Storage};
use crate::transcode::Transcoder;

pub use scratch::{compressed_filename, source_filename, JobScratch};

/// Runs jobs through the stages in order, each under its own retry budget.
///
/// Collaborators are built once per process and shared by every job.
#[derive(Clone)]
pub struct Pipeline {
    storage: Arc<dyn Storage>,
    transcoder: Arc<dyn Transcoder>,
    scratch_root: PathBuf,
    retries: StageRetries,
    failure_mode: FailureMode,
    transcode_slots: Arc<Semaphore>,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        transcoder: Arc<dyn Transcoder>,
        scratch_root: impl Into<PathBuf>,
        retries: StageRetries,
    ) -> Self {
        Self {
            storage,
            transcoder,
            scratch_root: scratch_root.into(),
            retries,
            failure_mode: FailureMode::default(),
            transcode_slots: Arc::new(Semaphore::new(1)),
            metrics: None,
        }
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Caps how many transcodes run at once across all jobs of this pipeline.
    pub fn with_transcode_slots(mut self, slots: usize) -> Self {
        self.transcode_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Same pipeline working under `<scratch_root>/<worker>/`.
    ///
    /// Clients and transcode slots stay shared with `self`.
    pub fn for_worker(&self, worker: &str) -> Self {
        let mut scoped = self.clone();
        scoped.scratch_root = self.scratch_root.join(scratch::path_component(worker));
        scoped
    }

    /// Processes one delivery of `job`.
    ///
    /// Safe to call again for the same job: every delivery starts from an
    /// empty scratch directory and leaves none behind. A pipeline failure
    /// becomes `Ok(JobOutcome::Failed)` under [`FailureMode::Swallow`] and
    /// `Err` under [`FailureMode::Propagate`].
    pub async fn process(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        info!(
            job_id = %job.id,
            url = %redact_url(job.file_url()),
            attempt = job.attempts_made,
            "Processing job"
        );

        if let Some(m) = &self.metrics {
            m.jobs_in_progress.inc();
        }
        let result = self.run(job).await;
        if let Some(m) = &self.metrics {
            m.jobs_in_progress.dec();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                info!(job_id = %job.id, elapsed_ms, "Job completed");
                self.record(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    stage = e.stage().map(|s| s.as_str()),
                    error = %e,
                    elapsed_ms,
                    "Job failed"
                );
                match self.failure_mode {
                    FailureMode::Swallow => {
                        let outcome = JobOutcome::Failed {
                            stage: e.stage(),
                            error: e.to_string(),
                        };
                        self.record(&outcome);
                        Ok(outcome)
                    }
                    FailureMode::Propagate => {
                        if let Some(m) = &self.metrics {
                            m.record_error();
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let filename = source_filename(job.file_url())?;
        let scratch = JobScratch::prepare(&self.scratch_root, &job.id, &filename).await?;

        let result = self.run_stages(job, &scratch, &filename).await;
        scratch.cleanup().await;
        result
    }

    async fn run_stages(
        &self,
        job: &Job,
        scratch: &JobScratch,
        filename: &str,
    ) -> Result<JobOutcome, JobError> {
        let input = scratch.input();
        let output = scratch.output();

        let input_bytes = run_with_retry(&self.retries.policy(Stage::Download), |_| async move {
            self.timed(Stage::Download, self.storage.download(job.file_url(), input))
                .await
                .map_err(JobError::Download)
        })
        .await?;
        debug!(job_id = %job.id, bytes = input_bytes, "Downloaded source");

        run_with_retry(&self.retries.policy(Stage::Transcode), |_| async move {
            let _slot = self
                .transcode_slots
                .acquire()
                .await
                .map_err(|_| JobError::Transcode(TranscodeError::SlotsClosed))?;
            self.timed(Stage::Transcode, self.transcoder.compress(input, output))
                .await
                .map_err(JobError::Transcode)
        })
        .await?;

        let output_bytes = tokio::fs::metadata(output)
            .await
            .map_err(|source| JobError::Scratch {
                path: output.to_path_buf(),
                source,
            })?
            .len();

        let key = compressed_filename(filename);
        let key_ref = key.as_str();
        run_with_retry(&self.retries.policy(Stage::Upload), |_| async move {
            self.timed(Stage::Upload, self.storage.upload(output, key_ref))
                .await
                .map_err(JobError::Upload)
        })
        .await?;

        Ok(JobOutcome::Uploaded {
            key,
            input_bytes,
            output_bytes,
        })
    }

    async fn timed<T, E>(&self, stage: Stage, attempt: impl Future<Output = Result<T, E>>) -> Result<T, E> {
        let started = Instant::now();
        let result = attempt.await;
        if let Some(m) = &self.metrics {
            m.record_attempt(stage, result.is_ok(), started.elapsed());
        }
        result
    }

    fn record(&self, outcome: &JobOutcome) {
        if let Some(m) = &self.metrics {
            m.record_outcome(outcome);
        }
    }
}
