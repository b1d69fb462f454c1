//! Configuration data structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{RetryPolicy, Stage};

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global application settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Job queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Bucket holding the original videos.
    pub source: SourceConfig,

    /// Bucket receiving the compressed videos.
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Presigned URL download settings.
    #[serde(default)]
    pub download: DownloadConfig,

    /// FFmpeg compression profile.
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding per-job scratch files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfig {
    /// Builds the Redis connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to enable Prometheus metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the Prometheus metrics HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

/// Which queue implementation backs the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable Redis-backed queue shared across processes.
    #[default]
    Redis,
    /// In-process queue; jobs live only as long as the process.
    Memory,
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Logical queue name, used as the Redis key prefix.
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Queue implementation.
    #[serde(default)]
    pub backend: QueueBackend,

    /// Options applied to every enqueued job.
    #[serde(default)]
    pub default_job_options: JobOptions,

    /// How long a worker slot blocks waiting for a job before polling again.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_seconds: u64,
}

impl QueueConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }
}

/// Per-job delivery options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Queue-level delivery attempts (1 = no queue retry).
    #[serde(default = "default_job_attempts")]
    pub attempts: u32,

    /// Fixed delay before a failed job is redelivered.
    #[serde(default = "default_backoff_ms")]
    pub backoff_delay_ms: u64,

    /// Completed jobs kept for inspection.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,

    /// Failed jobs kept for inspection.
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
}

/// S3 bucket holding the original videos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Custom endpoint for S3-compatible providers; AWS when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bucket region.
    #[serde(default = "default_source_region")]
    pub region: String,

    /// Bucket name.
    pub bucket: String,

    /// Environment variable names holding the credentials.
    #[serde(default = "default_source_credentials")]
    pub credentials: CredentialsConfig,

    /// Use path-style addressing (MinIO and similar).
    #[serde(default)]
    pub force_path_style: bool,

    /// Glob patterns an object key must match to be listed.
    #[serde(default = "default_key_patterns")]
    pub key_patterns: Vec<String>,

    /// Lifetime of presigned fetch URLs.
    #[serde(default = "default_url_ttl")]
    pub url_ttl_seconds: u64,
}

impl SourceConfig {
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_seconds)
    }
}

/// S3 bucket receiving the compressed videos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_endpoint")]
    pub endpoint: Option<String>,

    #[serde(default = "default_destination_region")]
    pub region: String,

    #[serde(default = "default_destination_bucket")]
    pub bucket: String,

    #[serde(default = "default_destination_credentials")]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub force_path_style: bool,

    /// Content type stamped on every uploaded object.
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Names of the environment variables carrying bucket credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    pub access_key_id_env: String,
    pub secret_access_key_env: String,
}

/// Presigned URL download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Connect and response timeout.
    #[serde(default = "default_download_timeout")]
    pub timeout_seconds: u64,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// FFmpeg compression profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// FFmpeg executable name or path.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Output width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Output height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// FFmpeg video encoder.
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    /// Output frame rate.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Constant rate factor (0-51, higher is smaller).
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// Encoder speed preset.
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Drop every audio stream.
    #[serde(default = "default_true")]
    pub drop_audio: bool,

    /// Move the moov atom to the front of the file.
    #[serde(default = "default_true")]
    pub faststart: bool,

    /// Kill FFmpeg after this many seconds. No limit when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// What the worker does with a job whose pipeline failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Log the failure and complete the job; queue retries never engage.
    #[default]
    Swallow,
    /// Report the failure to the queue so its attempts and backoff apply.
    Propagate,
}

/// Per-stage retry budgets (extra attempts after the first).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRetries {
    #[serde(default = "default_download_retries")]
    pub download: u32,

    #[serde(default = "default_transcode_retries")]
    pub transcode: u32,

    #[serde(default)]
    pub upload: u32,
}

impl StageRetries {
    pub fn policy(&self, stage: Stage) -> RetryPolicy {
        let retries = match stage {
            Stage::Download => self.download,
            Stage::Transcode => self.transcode,
            Stage::Upload => self.upload,
        };
        RetryPolicy::with_retries(stage, retries)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer name; must be unique and stable per worker process so
    /// stalled jobs are recovered after a restart. Defaults to `$HOSTNAME`.
    /// Also names this worker's subdirectory of the scratch dir.
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Jobs processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// FFmpeg processes allowed to run at once.
    #[serde(default = "default_transcode_slots")]
    pub transcode_slots: usize,

    #[serde(default)]
    pub retries: StageRetries,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Remove leftover job directories from this worker's scratch subdirectory at startup.
    #[serde(default = "default_true")]
    pub sweep_scratch_on_start: bool,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/compress_pipeline")
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_queue_name() -> String {
    "video-storage".to_string()
}

fn default_poll_timeout() -> u64 {
    5
}

fn default_job_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    5000
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed() -> usize {
    500
}

fn default_source_region() -> String {
    "us-east-1".to_string()
}

fn default_source_credentials() -> CredentialsConfig {
    CredentialsConfig {
        access_key_id_env: "AWS_ACCESS_KEY_ID".to_string(),
        secret_access_key_env: "AWS_SECRET_ACCESS_KEY".to_string(),
    }
}

fn default_key_patterns() -> Vec<String> {
    vec!["*.mp4".to_string()]
}

fn default_url_ttl() -> u64 {
    3600
}

fn default_destination_endpoint() -> Option<String> {
    Some("https://s3.ap-northeast-1.wasabisys.com".to_string())
}

fn default_destination_region() -> String {
    "ap-northeast-1".to_string()
}

fn default_destination_bucket() -> String {
    "task-smart-stream".to_string()
}

fn default_destination_credentials() -> CredentialsConfig {
    CredentialsConfig {
        access_key_id_env: "WASABI_ACCESS_KEY_ID".to_string(),
        secret_access_key_env: "WASABI_SECRET_ACCESS_KEY".to_string(),
    }
}

fn default_content_type() -> String {
    "video/mp4".to_string()
}

fn default_download_timeout() -> u64 {
    30
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_fps() -> u32 {
    8
}

fn default_crf() -> u8 {
    40
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_download_retries() -> u32 {
    3
}

fn default_transcode_retries() -> u32 {
    2
}

/// Worker name used when neither the config nor `HOSTNAME` provides one.
pub const FALLBACK_WORKER_NAME: &str = "worker";

/// The host name keeps the default unique per machine or container and
/// stable across restarts of the same one.
fn default_worker_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| FALLBACK_WORKER_NAME.to_string())
}

fn default_concurrency() -> usize {
    2
}

fn default_transcode_slots() -> usize {
    1
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scratch_dir: default_scratch_dir(),
            redis: RedisConfig::default(),
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_prometheus_port(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            backend: QueueBackend::default(),
            default_job_options: JobOptions::default(),
            poll_timeout_seconds: default_poll_timeout(),
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: default_job_attempts(),
            backoff_delay_ms: default_backoff_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_destination_endpoint(),
            region: default_destination_region(),
            bucket: default_destination_bucket(),
            credentials: default_destination_credentials(),
            force_path_style: false,
            content_type: default_content_type(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_download_timeout(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            width: default_width(),
            height: default_height(),
            video_codec: default_video_codec(),
            fps: default_fps(),
            crf: default_crf(),
            preset: default_preset(),
            drop_audio: true,
            faststart: true,
            timeout_seconds: None,
        }
    }
}

impl Default for StageRetries {
    fn default() -> Self {
        Self {
            download: default_download_retries(),
            transcode: default_transcode_retries(),
            upload: 0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            transcode_slots: default_transcode_slots(),
            retries: StageRetries::default(),
            failure_mode: FailureMode::default(),
            sweep_scratch_on_start: true,
        }
    }
}
