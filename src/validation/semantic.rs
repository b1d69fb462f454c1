//! Semantic validation for configuration values.

use crate::config::model::{AppConfig, QueueBackend, FALLBACK_WORKER_NAME};

use super::{ValidationIssue, ValidationResult};

/// Known x265/x264 speed presets.
const PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast",
    "medium", "slow", "slower", "veryslow", "placebo",
];

/// Longest lifetime S3 accepts for a presigned URL.
const MAX_URL_TTL_SECONDS: u64 = 7 * 24 * 3600;

/// Retry budgets above this are almost certainly a misconfiguration.
const RETRY_WARNING_THRESHOLD: u32 = 10;

/// Validates semantic correctness of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_transcode(config, &mut result);
    validate_worker(config, &mut result);
    validate_source(config, &mut result);

    if config.queue.default_job_options.attempts == 0 {
        result.add(
            ValidationIssue::error(
                "queue.default_job_options.attempts",
                "Jobs need at least one delivery attempt",
            )
            .with_suggestion("Use 1 to disable queue-level retries"),
        );
    }

    if config.download.timeout_seconds == 0 {
        result.add(ValidationIssue::error(
            "download.timeout_seconds",
            "Download timeout must be at least 1 second",
        ));
    }

    result
}

fn validate_transcode(config: &AppConfig, result: &mut ValidationResult) {
    let transcode = &config.transcode;

    if transcode.crf > 51 {
        result.add(
            ValidationIssue::error(
                "transcode.crf",
                format!("CRF {} is out of range", transcode.crf),
            )
            .with_suggestion("CRF must be between 0 and 51"),
        );
    }

    if transcode.fps == 0 {
        result.add(ValidationIssue::error("transcode.fps", "Frame rate must be at least 1"));
    }

    for (field, value) in [("width", transcode.width), ("height", transcode.height)] {
        if value == 0 || value % 2 != 0 {
            result.add(
                ValidationIssue::error(
                    format!("transcode.{}", field),
                    format!("{} {} must be a positive even number", field, value),
                )
                .with_suggestion("YUV 4:2:0 output requires even dimensions"),
            );
        }
    }

    if !PRESETS.contains(&transcode.preset.as_str()) {
        result.add(
            ValidationIssue::error(
                "transcode.preset",
                format!("Unknown preset: '{}'", transcode.preset),
            )
            .with_suggestion(format!("Did you mean '{}'?", find_similar_preset(&transcode.preset))),
        );
    }

    if transcode.timeout_seconds == Some(0) {
        result.add(ValidationIssue::error(
            "transcode.timeout_seconds",
            "Transcode timeout must be at least 1 second",
        ));
    }
}

fn validate_worker(config: &AppConfig, result: &mut ValidationResult) {
    let worker = &config.worker;

    if config.queue.backend == QueueBackend::Redis && worker.name == FALLBACK_WORKER_NAME {
        result.add(
            ValidationIssue::warning(
                "worker.name",
                format!(
                    "Worker name '{}' is shared by every worker without HOSTNAME; only one of them can run",
                    worker.name
                ),
            )
            .with_suggestion("Set worker.name or HOSTNAME to a per-host value"),
        );
    }

    if worker.concurrency == 0 {
        result.add(ValidationIssue::error(
            "worker.concurrency",
            "Concurrency must be at least 1",
        ));
    }

    if worker.transcode_slots == 0 {
        result.add(ValidationIssue::error(
            "worker.transcode_slots",
            "Transcode slots must be at least 1",
        ));
    } else if worker.transcode_slots > worker.concurrency {
        result.add(
            ValidationIssue::warning(
                "worker.transcode_slots",
                format!(
                    "{} transcode slots exceed concurrency {}; extra slots are never used",
                    worker.transcode_slots, worker.concurrency
                ),
            )
            .with_suggestion("Set transcode_slots at most equal to concurrency"),
        );
    }

    let retries = &worker.retries;
    for (stage, budget) in [
        ("download", retries.download),
        ("transcode", retries.transcode),
        ("upload", retries.upload),
    ] {
        if budget > RETRY_WARNING_THRESHOLD {
            result.add(ValidationIssue::warning(
                format!("worker.retries.{}", stage),
                format!("{} retries for the {} stage is unusually high", budget, stage),
            ));
        }
    }

    if retries.upload == 0 {
        result.add(
            ValidationIssue::warning(
                "worker.retries.upload",
                "Uploads are attempted once; a transient network error fails the job",
            )
            .with_suggestion("Set worker.retries.upload to retry uploads in place"),
        );
    }
}

fn validate_source(config: &AppConfig, result: &mut ValidationResult) {
    for (i, pattern) in config.source.key_patterns.iter().enumerate() {
        if let Err(e) = glob::Pattern::new(pattern) {
            result.add(ValidationIssue::error(
                format!("source.key_patterns[{}]", i),
                format!("Invalid glob pattern '{}': {}", pattern, e),
            ));
        }
    }

    let ttl = config.source.url_ttl_seconds;
    if ttl == 0 || ttl > MAX_URL_TTL_SECONDS {
        result.add(
            ValidationIssue::error(
                "source.url_ttl_seconds",
                format!("Presigned URL lifetime {}s is out of range", ttl),
            )
            .with_suggestion(format!("Use a value between 1 and {}", MAX_URL_TTL_SECONDS)),
        );
    }
}

/// Finds the known preset closest to the given input.
fn find_similar_preset(input: &str) -> &'static str {
    PRESETS
        .iter()
        .min_by_key(|p| strsim::levenshtein(input, p))
        .copied()
        .unwrap_or("ultrafast")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse;
    use std::path::Path;

    fn config(yaml: &str) -> AppConfig {
        parse(yaml, Path::new("test.yaml")).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let result = validate(&config("source:\n  bucket: originals\n"));
        assert!(result.is_valid());
        // Single-attempt upload is flagged but allowed.
        assert!(result.has_issue_at("worker.retries.upload"));
    }

    #[test]
    fn fallback_worker_name_is_flagged_on_shared_queue() {
        let result = validate(&config("source:\n  bucket: b\nworker:\n  name: worker\n"));
        assert!(result.is_valid());
        assert!(result.has_issue_at("worker.name"));

        let named = validate(&config("source:\n  bucket: b\nworker:\n  name: encoder-a\n"));
        assert!(!named.has_issue_at("worker.name"));

        let in_process = validate(&config(
            "source:\n  bucket: b\nqueue:\n  backend: memory\nworker:\n  name: worker\n",
        ));
        assert!(!in_process.has_issue_at("worker.name"));
    }

    #[test]
    fn misspelled_preset_gets_suggestion() {
        let result = validate(&config(
            "source:\n  bucket: b\ntranscode:\n  preset: ultrafst\n",
        ));
        let error = result.errors().next().unwrap();

        assert_eq!(error.path, "transcode.preset");
        assert_eq!(error.suggestion.as_deref(), Some("Did you mean 'ultrafast'?"));
    }

    #[test]
    fn odd_dimensions_and_bad_crf_rejected() {
        let result = validate(&config(
            "source:\n  bucket: b\ntranscode:\n  width: 1279\n  crf: 60\n",
        ));

        assert_eq!(result.error_count(), 2);
        assert!(result.has_issue_at("transcode.width"));
        assert!(result.has_issue_at("transcode.crf"));
    }

    #[test]
    fn zero_slots_and_bad_pattern_rejected() {
        let result = validate(&config(
            "source:\n  bucket: b\n  key_patterns: [\"[mp4\"]\nworker:\n  transcode_slots: 0\n",
        ));

        assert!(result.has_issue_at("worker.transcode_slots"));
        assert!(result.has_issue_at("source.key_patterns[0]"));
        assert!(!result.is_valid());
    }
}
