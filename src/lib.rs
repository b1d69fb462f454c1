//! Video Compress Pipeline - queue-driven video compression and republishing.
//!
//! An enqueue pass lists source videos in object storage and submits one job
//! per video. Workers drain the queue, running each job through download,
//! FFmpeg compression, upload to the destination bucket, and cleanup.

pub mod cli;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transcode;
pub mod validation;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, QueueListArgs, RunArgs};
use crate::config::model::{AppConfig, QueueBackend};
use crate::enqueue::{EnqueueSummary, Enqueuer};
use crate::metrics::{Metrics, MetricsServer};
use crate::pipeline::Pipeline;
use crate::queue::{JobQueue, JobStatus};
use crate::storage::{HttpDownloader, S3Catalog, S3Store, StorageClient};
use crate::transcode::FfmpegTranscoder;
use crate::validation::{report, validate_config, SystemCapabilities};
use crate::worker::Worker;

/// Printed by `enqueue` when the listing is empty.
const NOTHING_TO_ENQUEUE: &str = "No MP4 files found in S3.";

/// Runs the pipeline with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::Run(args) => run_worker(args, &cli.config).await,
        Commands::Enqueue => enqueue(&cli.config).await,
        Commands::ListAssets => list_assets(&cli.config).await,
        Commands::ConfigValidate => check_config(&cli.config).await,
        Commands::ConfigShow => show_config(&cli.config).await,
        Commands::QueueList(args) => list_queue(args, &cli.config).await,
        Commands::QueueClear => clear_queue(&cli.config).await,
        Commands::RetryFailed { job_id } => retry_failed(&cli.config, &job_id).await,
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Starts the worker and runs until Ctrl+C.
async fn run_worker(args: RunArgs, config_path: &Path) -> Result<()> {
    info!("Starting compression pipeline");

    let config = config::load_and_validate(config_path, true)?;
    info!("Configuration loaded and validated");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new()?);
    if config.global.prometheus.enabled {
        let server = MetricsServer::bind(metrics.clone(), config.global.prometheus.port).await?;
        let stop = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(stop).await {
                error!(error = %e, "Prometheus server failed");
            }
        });
    }

    let queue = queue::open(&config).await?;
    info!(queue = %config.queue.name, backend = ?config.queue.backend, "Job queue ready");

    if args.enqueue {
        let summary = enqueue_pass(&config, queue.clone()).await?;
        info!(
            enqueued = summary.enqueued_count,
            duplicates = summary.duplicates,
            "Initial enqueue pass done"
        );
    } else if config.queue.backend == QueueBackend::Memory {
        warn!("In-memory queue without --enqueue starts empty; the worker will idle");
    }

    let pipeline = Arc::new(build_pipeline(&config, metrics.clone())?);
    let worker = Worker::from_config(queue, pipeline, &config.worker, &config.queue).with_metrics(metrics);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, finishing in-flight jobs"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Compression pipeline is running. Press Ctrl+C to stop.");
    worker.run(shutdown_rx).await?;

    info!("Compression pipeline stopped");
    Ok(())
}

/// Builds the process-wide storage client, transcoder and pipeline.
fn build_pipeline(config: &AppConfig, metrics: Arc<Metrics>) -> Result<Pipeline> {
    let downloader = HttpDownloader::new(config.download.timeout())?;
    let destination = S3Store::new((&config.destination).into()).context("Failed to build destination client")?;
    let storage = StorageClient::new(downloader, destination, config.destination.content_type.clone());
    let transcoder = FfmpegTranscoder::from_config(&config.transcode);

    Ok(Pipeline::new(
        Arc::new(storage),
        Arc::new(transcoder),
        &config.global.scratch_dir,
        config.worker.retries,
    )
    .with_failure_mode(config.worker.failure_mode)
    .with_transcode_slots(config.worker.transcode_slots)
    .with_metrics(metrics))
}

fn build_catalog(config: &AppConfig) -> Result<S3Catalog> {
    let store = S3Store::new((&config.source).into()).context("Failed to build source client")?;
    Ok(S3Catalog::new(
        store,
        &config.source.key_patterns,
        config.source.url_ttl(),
    )?)
}

async fn enqueue_pass(config: &AppConfig, queue: Arc<dyn JobQueue>) -> Result<EnqueueSummary> {
    let catalog = build_catalog(config)?;
    let enqueuer = Enqueuer::new(Arc::new(catalog), queue);
    Ok(enqueuer.enqueue_all().await?)
}

/// Runs one enqueue pass and prints its summary.
async fn enqueue(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    if config.queue.backend == QueueBackend::Memory {
        warn!("In-memory queue is discarded when this command exits; use `run --enqueue` instead");
    }

    let queue = queue::open(&config).await?;
    let summary = enqueue_pass(&config, queue).await?;

    if summary.listed() == 0 {
        println!("{}", NOTHING_TO_ENQUEUE);
    } else {
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}

/// Prints the source keys matching the configured patterns.
async fn list_assets(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    let keys = build_catalog(&config)?.matching_keys().await?;

    if keys.is_empty() {
        println!("{}", NOTHING_TO_ENQUEUE);
    } else {
        println!("{} asset(s) in '{}':", keys.len(), config.source.bucket);
        for key in keys {
            println!("  {}", key);
        }
    }
    Ok(())
}

/// Validates the configuration file and prints the report.
async fn check_config(config_path: &Path) -> Result<()> {
    let config = config::load_from_path(config_path)?;

    let capabilities = match SystemCapabilities::detect(&config.transcode.ffmpeg_path) {
        Ok(capabilities) => Some(capabilities),
        Err(e) => {
            warn!(error = %e, "Skipping codec checks");
            None
        }
    };

    let result = validate_config(&config, capabilities.as_ref());
    println!("{}", report::format_report(&result));

    if !result.is_valid() {
        anyhow::bail!(error::ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }
    Ok(())
}

/// Displays the parsed configuration.
async fn show_config(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

/// Prints counts and jobs per queue state.
async fn list_queue(args: QueueListArgs, config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    let queue = queue::open(&config).await?;

    let counts = queue.counts().await?;
    println!("Queue '{}':", config.queue.name);
    for status in JobStatus::ALL {
        println!("  {:<10} {}", status.as_str(), counts.get(status));
    }

    for status in JobStatus::ALL {
        let jobs = queue.list(status, args.limit).await?;
        if jobs.is_empty() {
            continue;
        }

        println!("\n{} ({} shown):", status.as_str(), jobs.len());
        for job in jobs {
            let detail = job
                .failed_reason
                .clone()
                .unwrap_or_else(|| storage::redact_url(job.file_url()));
            println!(
                "  {} - attempts {}/{} - {}",
                job.id, job.attempts_made, job.max_attempts, detail
            );
        }
    }

    Ok(())
}

/// Drops all waiting jobs.
async fn clear_queue(config_path: &Path) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    let queue = queue::open(&config).await?;

    let count = queue.clear_waiting().await?;
    println!("Cleared {} job(s) from queue.", count);

    Ok(())
}

/// Moves a failed job back to the waiting list.
async fn retry_failed(config_path: &Path, job_id: &str) -> Result<()> {
    let config = config::load_and_validate(config_path, false)?;
    let queue = queue::open(&config).await?;

    queue.retry_failed(job_id).await?;
    println!("Job {} moved from failed back to the waiting list.", job_id);

    Ok(())
}
