//! Video compression through an external FFmpeg process.

pub mod ffmpeg;
pub mod progress;

use std::path::Path;

use async_trait::async_trait;

use crate::error::TranscodeError;

pub use ffmpeg::{CompressionProfile, Dimensions, FfmpegTranscoder};
pub use progress::{EncodeProgress, ProgressParser};

/// Converts one local file into a compressed local file under a fixed profile.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Writes the compressed form of `input` to `output`, replacing it if present.
    async fn compress(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}
