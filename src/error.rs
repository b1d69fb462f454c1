//! Error types for the compression pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::retry::Stage;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Job queue operation errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to Redis at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Failed to enqueue job: {0}")]
    EnqueueFailed(String),

    #[error("Failed to dequeue job: {0}")]
    DequeueFailed(String),

    #[error("Failed to update job: {0}")]
    UpdateFailed(String),

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job '{job_id}' is not in the {expected} state")]
    InvalidState { job_id: String, expected: String },

    #[error("Failed to serialize job: {0}")]
    SerializationFailed(String),

    #[error("Worker name '{name}' is held by another running worker")]
    WorkerNameInUse { name: String },
}

/// Object storage and download errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Environment variable '{var}' with storage credentials is not set")]
    MissingCredential { var: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to '{url}' timed out after {seconds} seconds")]
    Timeout { url: String, seconds: u64 },

    #[error("Request to '{url}' returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Local file error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to upload '{key}' to bucket '{bucket}': {message}")]
    UploadFailed {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to list bucket '{bucket}': {message}")]
    ListFailed { bucket: String, message: String },

    #[error("Invalid key pattern '{pattern}': {message}")]
    InvalidKeyPattern { pattern: String, message: String },

    #[error("Failed to presign '{key}': {message}")]
    PresignFailed { key: String, message: String },
}

/// Errors of one enqueue pass.
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Failed to list source assets: {0}")]
    Listing(#[from] StorageError),

    #[error("{failed} of {total} job submission(s) failed; first error: {first}")]
    Submit {
        failed: usize,
        total: usize,
        #[source]
        first: QueueError,
    },
}

/// Transcoding engine errors.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to spawn '{program}': {message}")]
    SpawnFailed { program: String, message: String },

    #[error("FFmpeg failed with exit code {code}: {stderr}")]
    EngineFailed { code: i32, stderr: String },

    #[error("Transcoding timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Transcoder produced no output at '{path}'")]
    OutputMissing { path: PathBuf },

    #[error("Transcode slot pool is closed")]
    SlotsClosed,
}

/// Returned by the retry executor when a policy allows no attempts at all.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Retry of {stage} stage failed without an explicit cause")]
pub struct RetryWithoutCause {
    pub stage: Stage,
}

/// Failures of a single job's pipeline, tagged by the stage that failed.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Fetch URL '{url}' has no filename component")]
    MalformedUrl { url: String },

    #[error("Scratch path '{path}' unavailable: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download failed: {0}")]
    Download(#[source] StorageError),

    #[error("Transcode failed: {0}")]
    Transcode(#[source] TranscodeError),

    #[error("Upload failed: {0}")]
    Upload(#[source] StorageError),

    #[error(transparent)]
    RetryWithoutCause(#[from] RetryWithoutCause),
}

impl JobError {
    /// Returns the pipeline stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Download(_) => Some(Stage::Download),
            Self::Transcode(_) => Some(Stage::Transcode),
            Self::Upload(_) => Some(Stage::Upload),
            Self::RetryWithoutCause(e) => Some(e.stage),
            Self::MalformedUrl { .. } | Self::Scratch { .. } => None,
        }
    }
}

/// Metrics registry and exporter errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),
}

impl From<prometheus::Error> for MetricsError {
    fn from(e: prometheus::Error) -> Self {
        Self::PrometheusFailed(e.to_string())
    }
}

/// Capability detection errors.
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Failed to run '{command}': {message}")]
    CommandFailed { command: String, message: String },

    #[error("Required tool '{tool}' not found in PATH")]
    ToolNotFound { tool: String },
}
