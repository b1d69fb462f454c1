//! FFmpeg subprocess wrapper for the fixed compression profile.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::progress::ProgressParser;
use super::Transcoder;
use crate::config::model::TranscodeConfig;
use crate::error::TranscodeError;

/// Lines of FFmpeg stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Output frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Encoder settings applied to every job.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionProfile {
    pub size: Dimensions,
    pub video_codec: String,
    pub fps: u32,
    pub crf: u8,
    pub preset: String,
    pub drop_audio: bool,
    pub faststart: bool,
}

impl From<&TranscodeConfig> for CompressionProfile {
    fn from(config: &TranscodeConfig) -> Self {
        Self {
            size: Dimensions {
                width: config.width,
                height: config.height,
            },
            video_codec: config.video_codec.clone(),
            fps: config.fps,
            crf: config.crf,
            preset: config.preset.clone(),
            drop_audio: config.drop_audio,
            faststart: config.faststart,
        }
    }
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self::from(&TranscodeConfig::default())
    }
}

/// Runs FFmpeg as a child process, one invocation per file.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    profile: CompressionProfile,
    timeout: Option<Duration>,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, profile: CompressionProfile) -> Self {
        Self {
            program: program.into(),
            profile,
            timeout: None,
        }
    }

    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self::new(&config.ffmpeg_path, CompressionProfile::from(config))
            .with_timeout(config.timeout_seconds.map(Duration::from_secs))
    }

    /// Kills FFmpeg when a single invocation runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn profile(&self) -> &CompressionProfile {
        &self.profile
    }

    /// Builds the FFmpeg argument list for one input/output pair.
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let p = &self.profile;
        let mut args: Vec<OsString> = Vec::with_capacity(32);

        for flag in ["-hide_banner", "-nostdin", "-nostats"] {
            args.push(flag.into());
        }
        args.extend(["-loglevel".into(), "error".into()]);
        // Machine-readable progress on stdout, errors only on stderr.
        args.extend(["-progress".into(), "pipe:1".into()]);
        args.push("-y".into());
        args.push("-i".into());
        args.push(input.into());

        args.extend(["-c:v".into(), p.video_codec.clone().into()]);
        args.push("-vf".into());
        args.push(format!("fps={},scale={}:{}", p.fps, p.size.width, p.size.height).into());
        args.extend(["-crf".into(), p.crf.to_string().into()]);
        args.extend(["-preset".into(), p.preset.clone().into()]);
        if p.drop_audio {
            args.push("-an".into());
        }
        args.extend(["-threads".into(), "0".into()]);
        if p.faststart {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }

        args.push(output.into());
        args
    }

    fn spawn_error(&self, e: std::io::Error) -> TranscodeError {
        TranscodeError::SpawnFailed {
            program: self.program.display().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn compress(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.build_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            input = %input.display(),
            output = %output.display(),
            codec = %self.profile.video_codec,
            size = %self.profile.size,
            crf = self.profile.crf,
            "Starting FFmpeg compression"
        );
        debug!(cmd = ?cmd, "Running FFmpeg");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let progress_task = child.stdout.take().map(|out| tokio::spawn(log_progress(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(stderr_tail(err)));

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed out FFmpeg process");
                    }
                    if let Some(task) = &progress_task {
                        task.abort();
                    }
                    if let Some(task) = &stderr_task {
                        task.abort();
                    }
                    return Err(TranscodeError::Timeout {
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => child.wait().await,
        };
        let status = waited.map_err(|e| self.spawn_error(e))?;

        if let Some(task) = progress_task {
            let _ = task.await;
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(TranscodeError::EngineFailed {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }

        let produced = tokio::fs::metadata(output)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(TranscodeError::OutputMissing {
                path: output.to_path_buf(),
            });
        }

        info!(
            output = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "FFmpeg compression completed"
        );
        Ok(())
    }
}

async fn log_progress<R: AsyncRead + Unpin>(stdout: R) {
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = ProgressParser::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(progress) = parser.feed(&line) {
            debug!(
                frame = progress.frame,
                out_time_ms = progress.out_time.map(|t| t.as_millis() as u64),
                speed = progress.speed.as_deref(),
                finished = progress.finished,
                "FFmpeg progress"
            );
        }
    }
}

async fn stderr_tail<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail).join("\n")
}
