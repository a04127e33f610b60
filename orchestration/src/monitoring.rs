//! Pattern-based issue detection over logs.
//!
//! Scans log output for known failure signatures (safety blocks,
//! timeouts, retry exhaustion, worker crashes, budget alerts, API and
//! merge trouble) and deduplicates repeats so one stuck loop does not
//! flood the operator channel.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Severity of a detected issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Critical,
}

/// A detected issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,
    pub severity: IssueSeverity,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub pattern: String,
}

// (regex, message template with {0}/{1} capture slots, severity)
const DEFAULT_PATTERNS: &[(&str, &str, IssueSeverity)] = &[
    // Safety blocks
    (
        r"SAFETY BLOCK[:\s]+Score\s+(\d+\.?\d*)",
        "Safety block detected: Score {0} below threshold",
        IssueSeverity::Critical,
    ),
    (
        r"safety score\s*[<:]\s*0\.85",
        "Safety score below threshold",
        IssueSeverity::Critical,
    ),
    (
        r#"Found dangerous pattern\s+['"]([^'"]+)['"]"#,
        "Dangerous pattern detected: {0}",
        IssueSeverity::Critical,
    ),
    // Timeouts
    (
        r"[Tt]imed?\s*out\s+(?:after\s+)?(\d+)s?",
        "Task timed out after {0}s",
        IssueSeverity::Critical,
    ),
    (
        r"exceeded maximum duration",
        "Workflow exceeded maximum duration",
        IssueSeverity::Critical,
    ),
    // Retry limits
    (
        r"[Rr]etry limit\s+(?:reached|hit|exceeded)",
        "Retry limit reached",
        IssueSeverity::Critical,
    ),
    (
        r"max(?:imum)?\s+retries?\s+(?:reached|hit|exceeded)",
        "Maximum retries exceeded",
        IssueSeverity::Critical,
    ),
    // Worker process trouble
    (
        r"exited with code\s+([1-9]\d*)",
        "Worker exited with error code {0}",
        IssueSeverity::Critical,
    ),
    (
        r"(?:worker|service)\s+(?:crashed|failed)",
        "Worker crashed",
        IssueSeverity::Critical,
    ),
    (
        r"restarting\s+\(attempt\s+(\d+)\)",
        "Worker restarting (attempt {0})",
        IssueSeverity::Warning,
    ),
    // Budget
    (
        r"[Bb]udget\s+(?:warning|alert)[:\s]+(\d+)%\s+used",
        "Budget warning: {0}% used",
        IssueSeverity::Warning,
    ),
    (
        r"[Bb]udget exceeded[:\s]+\$?(\d+\.?\d*)",
        "Budget exceeded: ${0}",
        IssueSeverity::Critical,
    ),
    // API errors
    (
        r"API\s+(?:error|failed)[:\s]+(.+)",
        "API error: {0}",
        IssueSeverity::Warning,
    ),
    (r"rate\s+limit(?:ed)?", "Rate limit hit", IssueSeverity::Warning),
    // Git and merge
    (r"merge conflict", "Merge conflict detected", IssueSeverity::Warning),
    (
        r"push\s+(?:failed|rejected)",
        "Git push failed",
        IssueSeverity::Warning,
    ),
];

struct CompiledPattern {
    regex: regex::Regex,
    template: String,
    severity: IssueSeverity,
}

/// Scans logs for issue signatures with dedup.
pub struct IssueDetector {
    patterns: Vec<CompiledPattern>,
    seen: Mutex<HashSet<String>>,
}

impl IssueDetector {
    pub fn new() -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .filter_map(|(pattern, template, severity)| {
                match RegexBuilder::new(pattern).build() {
                    Ok(regex) => Some(CompiledPattern {
                        regex,
                        template: template.to_string(),
                        severity: *severity,
                    }),
                    Err(e) => {
                        warn!(pattern, error = %e, "Skipping unparseable issue pattern");
                        None
                    }
                }
            })
            .collect();
        Self {
            patterns,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Add a custom detection pattern.
    pub fn add_pattern(
        &mut self,
        pattern: &str,
        template: &str,
        severity: IssueSeverity,
    ) -> Result<(), regex::Error> {
        self.patterns.push(CompiledPattern {
            regex: RegexBuilder::new(pattern).build()?,
            template: template.to_string(),
            severity,
        });
        Ok(())
    }

    /// Scan log content for issues. An issue with the same pattern and
    /// captures as one already reported is suppressed.
    pub fn detect(&self, content: &str, source: &str) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        for compiled in &self.patterns {
            for captures in compiled.regex.captures_iter(content) {
                let mut message = compiled.template.clone();
                for (index, capture) in captures.iter().skip(1).enumerate() {
                    if let Some(capture) = capture {
                        message = message.replace(&format!("{{{index}}}"), capture.as_str());
                    }
                }

                let dedup_key = format!("{}|{message}", compiled.regex.as_str());
                if !seen.insert(dedup_key) {
                    continue;
                }

                issues.push(Issue {
                    message,
                    severity: compiled.severity,
                    source: source.to_string(),
                    timestamp: Utc::now(),
                    pattern: compiled.regex.as_str().to_string(),
                });
            }
        }
        issues
    }

    /// Forget every reported issue, re-arming the detector.
    pub fn reset_dedup(&self) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// How many distinct issues have been reported.
    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for IssueDetector {
    fn default() -> Self {
        Self::new()
    }
}
