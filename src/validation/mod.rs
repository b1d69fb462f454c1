//! Configuration validation system.

pub mod codec;
pub mod paths;
pub mod report;
pub mod schema;
pub mod semantic;

use std::collections::HashSet;
use std::path::Path;

use crate::config::model::AppConfig;
use crate::error::CapabilityError;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Blocks configuration loading.
    Error,
    /// Logged but allows loading.
    Warning,
}

/// A validation issue found during configuration checking.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: ValidationSeverity,
    /// Path to the problematic config field (e.g., "worker.retries.upload").
    pub path: String,
    /// Description of the issue.
    pub message: String,
    /// Optional suggestion for fixing the issue.
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Creates a new error-level validation issue.
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Creates a new warning-level validation issue.
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Warning,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Adds a suggestion to this validation issue.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Result of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Creates an empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Adds an issue to the result.
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Extends the result with issues from another result.
    pub fn extend(&mut self, other: ValidationResult) {
        self.issues.extend(other.issues);
    }

    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == ValidationSeverity::Error)
    }

    /// Returns an iterator over error-level issues.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Error)
    }

    /// Returns an iterator over warning-level issues.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Warning)
    }

    /// Returns the number of errors.
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    /// Returns true if any issue points at the given config path.
    pub fn has_issue_at(&self, path: &str) -> bool {
        self.issues.iter().any(|i| i.path == path)
    }
}

/// System capabilities detected at startup.
#[derive(Debug, Clone, Default)]
pub struct SystemCapabilities {
    /// Available FFmpeg encoders.
    pub available_encoders: HashSet<String>,
}

impl SystemCapabilities {
    /// Detects system capabilities by querying the given FFmpeg binary.
    pub fn detect(ffmpeg: &Path) -> Result<Self, CapabilityError> {
        let output = std::process::Command::new(ffmpeg)
            .args(["-encoders", "-hide_banner"])
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CapabilityError::ToolNotFound {
                    tool: ffmpeg.display().to_string(),
                },
                _ => CapabilityError::CommandFailed {
                    command: format!("{} -encoders", ffmpeg.display()),
                    message: e.to_string(),
                },
            })?;

        if !output.status.success() {
            return Err(CapabilityError::CommandFailed {
                command: format!("{} -encoders", ffmpeg.display()),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self {
            available_encoders: parse_ffmpeg_codec_list(&stdout),
        })
    }
}

/// Parses FFmpeg encoder list output into a set of codec names.
fn parse_ffmpeg_codec_list(output: &str) -> HashSet<String> {
    let mut codecs = HashSet::new();

    // The flag legend (" V..... = Video") precedes a " ------" separator.
    let has_separator = output.lines().any(|l| l.trim().starts_with("---"));
    let mut in_listing = !has_separator;

    for line in output.lines() {
        // Lines look like: " V....D libx265              libx265 H.265 / HEVC"
        let trimmed = line.trim();
        if !in_listing {
            in_listing = trimmed.starts_with("---");
            continue;
        }
        if trimmed.is_empty() || trimmed.contains("Encoders:") {
            continue;
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() >= 2 && parts[1] != "=" && is_capability_flags(parts[0]) {
            codecs.insert(parts[1].to_string());
        }
    }

    codecs
}

/// Matches the six-character flag column, e.g. "V....D" or "A....." .
fn is_capability_flags(flags: &str) -> bool {
    flags.len() == 6
        && flags.starts_with(['V', 'A', 'S'])
        && flags.chars().skip(1).all(|c| c == '.' || c.is_ascii_uppercase())
}

/// Validates the configuration; the codec layer only runs when capabilities are known.
pub fn validate_config(
    config: &AppConfig,
    capabilities: Option<&SystemCapabilities>,
) -> ValidationResult {
    let mut result = ValidationResult::new();

    result.extend(schema::validate(config));
    result.extend(semantic::validate(config));
    if let Some(capabilities) = capabilities {
        result.extend(codec::validate(config, capabilities));
    }
    result.extend(paths::validate(config));

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encoder_listing() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264\n V....D libx265              libx265 H.265 / HEVC\n A....D aac                  AAC (Advanced Audio Coding)\n";
        let codecs = parse_ffmpeg_codec_list(listing);

        assert!(codecs.contains("libx265"));
        assert!(codecs.contains("libx264"));
        assert!(codecs.contains("aac"));
        assert!(!codecs.contains("="));
    }

    #[test]
    fn legend_lines_are_not_encoders() {
        let listing = "Encoders:\n V..... = Video\n A..... = Audio\n S..... = Subtitle\n .F.... = Frame-level multithreading\n ------\n V....D libx265              libx265 H.265 / HEVC\n";
        let codecs = parse_ffmpeg_codec_list(listing);

        assert_eq!(codecs.len(), 1);
        assert!(codecs.contains("libx265"));
    }

    #[test]
    fn listing_without_separator_is_still_parsed() {
        let codecs = parse_ffmpeg_codec_list(" V....D libx264 H.264\n V..... = Video\n");

        assert_eq!(codecs.into_iter().collect::<Vec<_>>(), vec!["libx264".to_string()]);
    }
}
