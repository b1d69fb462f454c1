//! Validation report formatting.

use std::collections::BTreeMap;

use super::{ValidationIssue, ValidationResult, ValidationSeverity};

/// Formats a validation result into a human-readable report, grouped by
/// top-level config section with errors ahead of warnings in each group.
pub fn format_report(result: &ValidationResult) -> String {
    let error_count = result.error_count();
    let warning_count = result.warnings().count();

    if error_count == 0 && warning_count == 0 {
        return "Configuration is valid.".to_string();
    }

    let mut sections: BTreeMap<&str, Vec<&ValidationIssue>> = BTreeMap::new();
    for issue in result.errors().chain(result.warnings()) {
        sections.entry(section_of(&issue.path)).or_default().push(issue);
    }

    let mut report = String::new();
    if error_count > 0 {
        report.push_str("\nConfig Validation Failed\n");
        report.push_str("========================\n");
    }

    for (section, issues) in sections {
        report.push_str(&format!("\n[{}]\n", section));
        for issue in issues {
            report.push_str(&format_issue(issue));
        }
    }

    report.push_str("\n---\n");
    report.push_str(&format!("{} warning(s), {} error(s)\n", warning_count, error_count));
    if error_count > 0 {
        report.push_str("Config rejected.\n");
    }

    report
}

/// Top-level section of a dotted config path ("worker.retries.upload" -> "worker").
fn section_of(path: &str) -> &str {
    path.split(['.', '[']).next().unwrap_or(path)
}

fn format_issue(issue: &ValidationIssue) -> String {
    let prefix = match issue.severity {
        ValidationSeverity::Error => "ERROR",
        ValidationSeverity::Warning => "WARNING",
    };

    let mut output = format!("{} {}\n  └─ {}\n", prefix, issue.path, issue.message);
    if let Some(suggestion) = &issue.suggestion {
        output.push_str(&format!("     {}\n", suggestion));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_report() {
        assert_eq!(format_report(&ValidationResult::new()), "Configuration is valid.");
    }

    #[test]
    fn issues_grouped_by_section() {
        let mut result = ValidationResult::new();
        result.add(ValidationIssue::warning("worker.retries.upload", "single attempt"));
        result.add(
            ValidationIssue::error("transcode.crf", "CRF 60 is out of range")
                .with_suggestion("CRF must be between 0 and 51"),
        );
        result.add(ValidationIssue::error("source.key_patterns[0]", "bad pattern"));

        let report = format_report(&result);

        let source_at = report.find("[source]").unwrap();
        let transcode_at = report.find("[transcode]").unwrap();
        let worker_at = report.find("[worker]").unwrap();
        assert!(source_at < transcode_at && transcode_at < worker_at);
        assert!(report.contains("     CRF must be between 0 and 51"));
        assert!(report.contains("1 warning(s), 2 error(s)"));
        assert!(report.contains("Config rejected."));
    }

    #[test]
    fn section_of_indexed_path() {
        assert_eq!(section_of("source.key_patterns[0]"), "source");
        assert_eq!(section_of("queue"), "queue");
    }
}
