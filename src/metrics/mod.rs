//! Prometheus metrics for the compression pipeline.

pub mod server;

use std::time::Duration;

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::error::MetricsError;
use crate::queue::{JobCounts, JobOutcome, JobStatus};
use crate::retry::Stage;

pub use server::MetricsServer;

/// Pipeline metrics and the registry that exports them.
pub struct Metrics {
    registry: Registry,
    /// Finished jobs by outcome (`uploaded`, `failed`, `errored`).
    pub jobs_total: IntCounterVec,
    /// Stage attempts by stage and result.
    pub stage_attempts_total: IntCounterVec,
    /// Wall time of each stage attempt.
    pub stage_duration_seconds: HistogramVec,
    /// Input size over output size for uploaded jobs.
    pub compression_ratio: Histogram,
    pub jobs_in_progress: Gauge,
    /// Jobs per queue state.
    pub queue_depth: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("compress_jobs_total", "Jobs finished by the pipeline"),
            &["outcome"],
        )?;

        let stage_attempts_total = IntCounterVec::new(
            Opts::new("compress_stage_attempts_total", "Pipeline stage attempts"),
            &["stage", "result"],
        )?;

        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "compress_stage_duration_seconds",
                "Time spent in one stage attempt in seconds",
            )
            .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0]),
            &["stage"],
        )?;

        let compression_ratio = Histogram::with_opts(
            HistogramOpts::new(
                "compress_compression_ratio",
                "Ratio of input size to compressed output size",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )?;

        let jobs_in_progress = Gauge::new(
            "compress_jobs_in_progress",
            "Jobs currently running through the pipeline",
        )?;

        let queue_depth = GaugeVec::new(
            Opts::new("compress_queue_depth", "Jobs in the queue by state"),
            &["state"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(stage_attempts_total.clone()))?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;
        registry.register(Box::new(compression_ratio.clone()))?;
        registry.register(Box::new(jobs_in_progress.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            stage_attempts_total,
            stage_duration_seconds,
            compression_ratio,
            jobs_in_progress,
            queue_depth,
        })
    }

    /// Records one attempt of a stage.
    pub fn record_attempt(&self, stage: Stage, succeeded: bool, elapsed: Duration) {
        let result = if succeeded { "success" } else { "failure" };
        self.stage_attempts_total
            .with_label_values(&[stage.as_str(), result])
            .inc();
        self.stage_duration_seconds
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Records a job the pipeline finished without error.
    pub fn record_outcome(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Uploaded {
                input_bytes,
                output_bytes,
                ..
            } => {
                self.jobs_total.with_label_values(&["uploaded"]).inc();
                if *output_bytes > 0 {
                    self.compression_ratio
                        .observe(*input_bytes as f64 / *output_bytes as f64);
                }
            }
            JobOutcome::Failed { .. } => {
                self.jobs_total.with_label_values(&["failed"]).inc();
            }
        }
    }

    /// Records a job whose error was handed to the queue.
    pub fn record_error(&self) {
        self.jobs_total.with_label_values(&["errored"]).inc();
    }

    pub fn set_queue_depth(&self, counts: &JobCounts) {
        for status in JobStatus::ALL {
            self.queue_depth
                .with_label_values(&[status.as_str()])
                .set(counts.get(status) as f64);
        }
    }

    /// Renders every metric in the Prometheus text format.
    pub fn gather(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::PrometheusFailed(e.to_string()))
    }
}
