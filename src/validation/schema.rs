//! Schema validation for configuration structure.

use crate::config::model::AppConfig;
use super::{ValidationIssue, ValidationResult};

/// Validates required fields and structure.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.source.bucket.trim().is_empty() {
        result.add(ValidationIssue::error(
            "source.bucket",
            "Source bucket name is required",
        ));
    }

    if config.destination.bucket.trim().is_empty() {
        result.add(ValidationIssue::error(
            "destination.bucket",
            "Destination bucket name is required",
        ));
    }

    if config.queue.name.trim().is_empty() {
        result.add(ValidationIssue::error("queue.name", "Queue name cannot be empty"));
    }

    if config.worker.name.trim().is_empty() {
        result.add(ValidationIssue::error("worker.name", "Worker name cannot be empty"));
    }

    if config.source.key_patterns.is_empty() {
        result.add(
            ValidationIssue::error("source.key_patterns", "At least one key pattern is required")
                .with_suggestion("Use [\"*.mp4\"] to list MP4 files"),
        );
    }

    if config.destination.content_type.trim().is_empty() {
        result.add(ValidationIssue::error(
            "destination.content_type",
            "Content type cannot be empty",
        ));
    }

    if config.source.bucket == config.destination.bucket
        && config.source.endpoint == config.destination.endpoint
    {
        result.add(
            ValidationIssue::warning(
                "destination.bucket",
                "Source and destination are the same bucket",
            )
            .with_suggestion("Compressed files match '*.mp4' and will be listed again"),
        );
    }

    result
}
