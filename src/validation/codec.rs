//! Codec availability validation.

use crate::config::model::AppConfig;

use super::{SystemCapabilities, ValidationIssue, ValidationResult};

/// Validates that the configured video encoder is built into FFmpeg.
pub fn validate(config: &AppConfig, capabilities: &SystemCapabilities) -> ValidationResult {
    let mut result = ValidationResult::new();

    let codec = &config.transcode.video_codec;
    if !capabilities.available_encoders.contains(codec) {
        result.add(
            ValidationIssue::error(
                "transcode.video_codec",
                format!("Video encoder '{}' is not available in FFmpeg", codec),
            )
            .with_suggestion(suggest_video_codec(capabilities)),
        );
    }

    result
}

/// Suggests HEVC-family alternatives that this FFmpeg build does provide.
fn suggest_video_codec(capabilities: &SystemCapabilities) -> String {
    let common_codecs = ["libx265", "hevc_nvenc", "hevc_qsv", "hevc_vaapi", "libx264"];

    let available: Vec<&str> = common_codecs
        .iter()
        .filter(|c| capabilities.available_encoders.contains(**c))
        .copied()
        .collect();

    if available.is_empty() {
        "Install an FFmpeg build with libx265 support".to_string()
    } else {
        format!("Available alternatives: {}", available.join(", "))
    }
}
