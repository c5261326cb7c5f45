use super::audit::{AuditKind, AuditLogger, AuditSeverity};
use html_escape::encode_text;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    Low,
    Medium,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeViolation {
    pub pattern: String,
    pub severity: PatternSeverity,
}

/// Outcome of one scan.
///
/// `successful == false` means a critical pattern was found; the sanitized
/// form is still returned so it can be logged for forensics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeOutcome {
    pub sanitized: String,
    pub violations: Vec<SanitizeViolation>,
    pub successful: bool,
}

/// Known attack substrings, lowercased, with how seriously to take each.
/// Code-execution markers are critical; noisy-but-suspicious fragments are not.
const PATTERNS: &[(&str, PatternSeverity)] = &[
    // Script / markup injection
    ("<script", PatternSeverity::Critical),
    ("javascript:", PatternSeverity::Critical),
    ("vbscript:", PatternSeverity::Critical),
    ("data:text/html", PatternSeverity::Critical),
    // Shell metacharacter sequences
    ("$(", PatternSeverity::Critical),
    ("`rm", PatternSeverity::Critical),
    (";rm", PatternSeverity::Critical),
    ("&&", PatternSeverity::Medium),
    ("||", PatternSeverity::Medium),
    // SQL-like fragments
    ("union select", PatternSeverity::Medium),
    ("drop table", PatternSeverity::Medium),
    ("delete from", PatternSeverity::Medium),
    ("';", PatternSeverity::Low),
    // Path traversal
    ("../", PatternSeverity::Medium),
    ("..\\", PatternSeverity::Medium),
    ("file://", PatternSeverity::Medium),
    ("/etc/passwd", PatternSeverity::Medium),
];

/// Inline handlers and framed javascript slip past plain substring checks.
const REGEX_PATTERNS: &[(&str, PatternSeverity)] = &[
    (r"(?i)\bon[a-z]+\s*=", PatternSeverity::Critical),
    (r"(?i)<\s*iframe", PatternSeverity::Critical),
    (r"(?i)\beval\s*\(", PatternSeverity::Critical),
];

/// Scans entity input for hostile patterns before it reaches storage.
pub struct DataSanitizer {
    audit: Arc<AuditLogger>,
    regexes: Vec<(Regex, PatternSeverity)>,
}

impl DataSanitizer {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        let regexes = REGEX_PATTERNS
            .iter()
            .filter_map(|(pattern, severity)| {
                Regex::new(pattern).ok().map(|r| (r, *severity))
            })
            .collect();
        Self { audit, regexes }
    }

    pub fn scan(&self, input: &str) -> SanitizeOutcome {
        let lowered = input.to_lowercase();
        let mut violations: Vec<SanitizeViolation> = PATTERNS
            .iter()
            .filter(|(pattern, _)| lowered.contains(pattern))
            .map(|(pattern, severity)| SanitizeViolation {
                pattern: (*pattern).to_string(),
                severity: *severity,
            })
            .collect();
        violations.extend(self.regexes.iter().filter_map(|(regex, severity)| {
            regex.is_match(input).then(|| SanitizeViolation {
                pattern: regex.as_str().to_string(),
                severity: *severity,
            })
        }));

        let critical = violations
            .iter()
            .any(|v| v.severity == PatternSeverity::Critical);

        if !violations.is_empty() {
            let severity = if critical {
                AuditSeverity::Critical
            } else {
                AuditSeverity::Warning
            };
            let matched: Vec<&str> = violations.iter().map(|v| v.pattern.as_str()).collect();
            self.audit.record(
                AuditKind::DataSanitization,
                severity,
                None,
                format!("patterns={matched:?} len={}", input.len()),
            );
        }

        SanitizeOutcome {
            sanitized: encode_text(input).to_string(),
            violations,
            successful: !critical,
        }
    }
}
