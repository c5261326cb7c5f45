use crate::constants::{
    AUDIT_RING_CAPACITY, AUDIT_ROTATE_BYTES, SUSPICIOUS_AUTH_FAILURES, SUSPICIOUS_AUTH_WINDOW_SECS,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    PathValidation,
    SecurityViolation,
    AuthSuccess,
    AuthFailure,
    AccessDenied,
    LockConflict,
    DataSanitization,
    SuspiciousActivity,
    Admin,
}

impl AuditKind {
    pub fn label(&self) -> &'static str {
        match self {
            AuditKind::PathValidation => "path_validation",
            AuditKind::SecurityViolation => "security_violation",
            AuditKind::AuthSuccess => "auth_success",
            AuditKind::AuthFailure => "auth_failure",
            AuditKind::AccessDenied => "access_denied",
            AuditKind::LockConflict => "lock_conflict",
            AuditKind::DataSanitization => "data_sanitization",
            AuditKind::SuspiciousActivity => "suspicious_activity",
            AuditKind::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    pub actor: Option<String>,
    pub detail: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

struct AuditInner {
    ring: VecDeque<AuditRecord>,
    written_bytes: u64,
}

/// Append-only security event log.
///
/// Records go to a bounded in-memory ring (for reports) and a JSONL file
/// under the data dir's `logs/`; the file is rotated into a `.tar.gz`
/// archive once it grows past the rotation threshold.
pub struct AuditLogger {
    inner: Mutex<AuditInner>,
    log_path: PathBuf,
}

impl AuditLogger {
    pub fn new(logs_dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&logs_dir) {
            error!("could not create audit log dir: {e}");
        }
        Self {
            inner: Mutex::new(AuditInner {
                ring: VecDeque::with_capacity(AUDIT_RING_CAPACITY),
                written_bytes: 0,
            }),
            log_path: logs_dir.join("audit.jsonl"),
        }
    }

    pub fn record(
        &self,
        kind: AuditKind,
        severity: AuditSeverity,
        actor: Option<&str>,
        detail: impl Into<String>,
    ) -> AuditRecord {
        self.record_with_correlation(kind, severity, actor, detail, None)
    }

    pub fn record_with_correlation(
        &self,
        kind: AuditKind,
        severity: AuditSeverity,
        actor: Option<&str>,
        detail: impl Into<String>,
        correlation_id: Option<String>,
    ) -> AuditRecord {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            actor: actor.map(str::to_string),
            detail: detail.into(),
            correlation_id,
        };

        let suspicious = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.ring.len() >= AUDIT_RING_CAPACITY {
                inner.ring.pop_front();
            }
            inner.ring.push_back(record.clone());
            self.append_line(&mut inner, &record);

            if kind == AuditKind::AuthFailure {
                self.auth_failure_cluster(&inner, record.actor.as_deref())
            } else {
                None
            }
        };

        if let Some(actor) = suspicious {
            warn!(actor = %actor, "suspicious activity: repeated auth failures");
            self.record(
                AuditKind::SuspiciousActivity,
                AuditSeverity::Critical,
                Some(&actor),
                format!("{SUSPICIOUS_AUTH_FAILURES}+ failed auth events within {SUSPICIOUS_AUTH_WINDOW_SECS}s"),
            );
        }

        record
    }

    fn auth_failure_cluster(&self, inner: &AuditInner, actor: Option<&str>) -> Option<String> {
        let actor = actor?;
        let cutoff = Utc::now() - ChronoDuration::seconds(SUSPICIOUS_AUTH_WINDOW_SECS);
        let failures = inner
            .ring
            .iter()
            .rev()
            .take_while(|r| r.timestamp >= cutoff)
            .filter(|r| r.kind == AuditKind::AuthFailure && r.actor.as_deref() == Some(actor))
            .count();
        (failures >= SUSPICIOUS_AUTH_FAILURES).then(|| actor.to_string())
    }

    fn append_line(&self, inner: &mut AuditInner, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!("audit record serialization failed: {e}");
                return;
            }
        };

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| writeln!(f, "{line}"));

        match result {
            Ok(()) => {
                inner.written_bytes += line.len() as u64 + 1;
                if inner.written_bytes > AUDIT_ROTATE_BYTES {
                    self.rotate(inner);
                }
            }
            Err(e) => error!("audit append failed: {e}"),
        }
    }

    /// Move the active file aside and compress it; the active log starts fresh.
    fn rotate(&self, inner: &mut AuditInner) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let rotated = self.log_path.with_file_name(format!("audit-{stamp}.jsonl"));
        let archive = self.log_path.with_file_name(format!("audit-{stamp}.tar.gz"));

        if let Err(e) = std::fs::rename(&self.log_path, &rotated) {
            error!("audit rotation rename failed: {e}");
            return;
        }
        inner.written_bytes = 0;

        let result = (|| -> std::io::Result<()> {
            let file = std::fs::File::create(&archive)?;
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            builder.append_path_with_name(&rotated, rotated.file_name().unwrap())?;
            builder.into_inner()?.finish()?;
            std::fs::remove_file(&rotated)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!("audit archive failed: {e}");
        }
    }

    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ring.iter().rev().take(n).cloned().collect()
    }

    pub fn compliance_report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ComplianceReport {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_kind: HashMap<String, u64> = HashMap::new();
        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;

        for record in inner
            .ring
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
        {
            total += 1;
            *by_kind.entry(record.kind.label().to_string()).or_default() += 1;
            let severity = format!("{:?}", record.severity).to_lowercase();
            *by_severity.entry(severity).or_default() += 1;
        }

        ComplianceReport {
            start,
            end,
            total,
            by_kind,
            by_severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (tempfile::TempDir, AuditLogger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().to_path_buf());
        (dir, logger)
    }

    #[test]
    fn records_land_in_ring_and_file() {
        let (dir, logger) = logger();
        logger.record(
            AuditKind::PathValidation,
            AuditSeverity::Info,
            Some("session-1"),
            "verdict=ok",
        );

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, AuditKind::PathValidation);

        let contents = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert!(contents.contains("path_validation"));
    }

    #[test]
    fn compliance_report_counts_by_kind_and_severity() {
        let (_dir, logger) = logger();
        logger.record(AuditKind::AuthSuccess, AuditSeverity::Info, Some("u"), "ok");
        logger.record(AuditKind::AuthFailure, AuditSeverity::Warning, Some("u"), "bad");
        logger.record(AuditKind::AuthFailure, AuditSeverity::Warning, Some("v"), "bad");

        let report = logger.compliance_report(
            Utc::now() - ChronoDuration::minutes(1),
            Utc::now() + ChronoDuration::minutes(1),
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.by_kind.get("auth_failure"), Some(&2));
        assert_eq!(report.by_severity.get("warning"), Some(&2));
    }

    #[test]
    fn repeated_auth_failures_flag_suspicious_activity() {
        let (_dir, logger) = logger();
        for _ in 0..SUSPICIOUS_AUTH_FAILURES {
            logger.record(
                AuditKind::AuthFailure,
                AuditSeverity::Warning,
                Some("attacker"),
                "invalid token",
            );
        }

        let kinds: Vec<AuditKind> = logger.recent(20).iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&AuditKind::SuspiciousActivity));
    }

    #[test]
    fn failures_from_distinct_actors_do_not_cluster() {
        let (_dir, logger) = logger();
        for i in 0..SUSPICIOUS_AUTH_FAILURES {
            logger.record(
                AuditKind::AuthFailure,
                AuditSeverity::Warning,
                Some(&format!("actor-{i}")),
                "invalid token",
            );
        }
        let kinds: Vec<AuditKind> = logger.recent(20).iter().map(|r| r.kind).collect();
        assert!(!kinds.contains(&AuditKind::SuspiciousActivity));
    }
}
