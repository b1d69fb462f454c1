//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Compresses videos listed in object storage and republishes them.
#[derive(Parser, Debug)]
#[command(name = "compress-pipeline", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/pipeline.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the worker and process jobs until Ctrl+C.
    Run(RunArgs),

    /// List the source bucket and enqueue one job per video.
    Enqueue,

    /// Print the source keys an enqueue pass would pick up.
    #[command(name = "list-assets")]
    ListAssets,

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// Show job counts and jobs per queue state.
    #[command(name = "queue-list")]
    QueueList(QueueListArgs),

    /// Drop every waiting job from the queue.
    #[command(name = "queue-clear")]
    QueueClear,

    /// Move a failed job back to the waiting list.
    #[command(name = "retry-failed")]
    RetryFailed {
        /// The job ID to retry.
        job_id: String,
    },
}

/// Arguments for the run subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run one enqueue pass before the worker starts pulling.
    #[arg(long, default_value = "false")]
    pub enqueue: bool,
}

/// Arguments for the queue-list subcommand.
#[derive(Args, Debug)]
pub struct QueueListArgs {
    /// Maximum jobs shown per state.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_enqueue() {
        let cli = Cli::try_parse_from(["compress-pipeline", "-v", "run", "--enqueue"]).unwrap();
        assert!(matches!(cli.command, Commands::Run(RunArgs { enqueue: true })));
        assert_eq!(cli.log_level(), "debug");
    }

    #[test]
    fn parses_retry_failed() {
        let cli = Cli::try_parse_from(["compress-pipeline", "retry-failed", "video-3", "-c", "/tmp/p.yaml"]).unwrap();
        match cli.command {
            Commands::RetryFailed { job_id } => assert_eq!(job_id, "video-3"),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("/tmp/p.yaml"));
    }

    #[test]
    fn queue_list_limit_defaults() {
        let cli = Cli::try_parse_from(["compress-pipeline", "queue-list"]).unwrap();
        assert!(matches!(cli.command, Commands::QueueList(QueueListArgs { limit: 20 })));
    }
}
