use super::audit::{AuditKind, AuditLogger, AuditSeverity};
use crate::config::{SecurityConfig, SecurityMode};
use crate::constants::MAX_PATH_LEN;
use crate::error::ViolationKind;
use crate::{LoomError, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Characters that never belong in a stored path.
const RESERVED_CHARS: &[char] = &['<', '>', '|', '?', '*', '"'];

/// Validates filesystem paths against the configured allow-list.
///
/// Rejection messages never echo the probed path; the full before/after pair
/// goes to the audit log instead.
pub struct PathValidator {
    roots: Vec<PathBuf>,
    mode: SecurityMode,
    allow_symlinks: bool,
    allowed_extensions: Vec<String>,
    audit: Arc<AuditLogger>,
}

impl PathValidator {
    pub fn new(config: &SecurityConfig, audit: Arc<AuditLogger>) -> Self {
        let roots = config
            .allowed_directories
            .iter()
            .map(|dir| {
                // Canonicalize where possible so later prefix checks compare
                // like with like; missing roots fall back to the lexical form.
                std::fs::canonicalize(dir).unwrap_or_else(|_| normalize(Path::new(dir)))
            })
            .collect();

        Self {
            roots,
            mode: config.mode,
            allow_symlinks: config.allow_symlinks,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            audit: audit.clone(),
        }
    }

    /// Validate `original` for `mode` access on behalf of `session`.
    ///
    /// Returns the canonical path on success.
    pub fn validate(&self, session: &str, original: &str, mode: AccessMode) -> Result<PathBuf> {
        let start = Instant::now();
        let outcome = self.check(original, mode);

        let elapsed_ns = start.elapsed().as_nanos();
        match &outcome {
            Ok(canonical) => {
                self.audit.record(
                    AuditKind::PathValidation,
                    AuditSeverity::Info,
                    Some(session),
                    format!(
                        "verdict=ok original={original} canonical={} elapsed_ns={elapsed_ns}",
                        canonical.display()
                    ),
                );
            }
            Err(kind) => {
                self.audit.record(
                    AuditKind::SecurityViolation,
                    AuditSeverity::Warning,
                    Some(session),
                    format!("verdict=rejected violation={kind} original={original} elapsed_ns={elapsed_ns}"),
                );
            }
        }

        outcome.map_err(|kind| LoomError::SecurityViolation { kind })
    }

    fn check(&self, original: &str, _mode: AccessMode) -> std::result::Result<PathBuf, ViolationKind> {
        if original.is_empty() || original.len() > MAX_PATH_LEN {
            return Err(ViolationKind::Malformed);
        }
        if original.chars().any(|c| c == '\0' || c.is_control()) {
            return Err(ViolationKind::Malformed);
        }
        if original.chars().any(|c| RESERVED_CHARS.contains(&c)) {
            return Err(ViolationKind::Malformed);
        }
        if original.starts_with('~') {
            return Err(ViolationKind::Malformed);
        }
        if Path::new(original)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ViolationKind::Traversal);
        }

        let candidate = Path::new(original);
        let absolute = if candidate.is_absolute() {
            normalize(candidate)
        } else {
            let base = self.roots.first().cloned().unwrap_or_else(|| PathBuf::from("/"));
            normalize(&base.join(candidate))
        };

        let inside_roots = self.roots.iter().any(|root| absolute.starts_with(root));
        if !inside_roots {
            if self.mode == SecurityMode::Strict {
                return Err(ViolationKind::Whitelist);
            }
            debug!("permissive mode: allowing path outside configured roots");
        }

        if !self.allow_symlinks {
            if let Ok(meta) = std::fs::symlink_metadata(&absolute) {
                if meta.file_type().is_symlink() {
                    return Err(ViolationKind::Symlink);
                }
            }
        }

        if self.mode == SecurityMode::Strict && !self.allowed_extensions.is_empty() {
            let ext = absolute
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            match ext {
                Some(ext) if self.allowed_extensions.contains(&ext) => {}
                _ => return Err(ViolationKind::Whitelist),
            }
        }

        Ok(absolute)
    }
}

/// Lexical normalization: resolves `.` segments without touching the
/// filesystem. `..` never survives to this point.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(dir: &Path) -> (Arc<AuditLogger>, PathValidator) {
        let audit = Arc::new(AuditLogger::new(dir.join("logs")));
        std::fs::create_dir_all(dir.join("logs")).unwrap();
        let config = SecurityConfig {
            allowed_directories: vec![dir.to_string_lossy().to_string()],
            ..Default::default()
        };
        let v = PathValidator::new(&config, audit.clone());
        (audit, v)
    }

    #[test]
    fn traversal_is_rejected_without_leaking_path() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, validator) = validator(dir.path());

        let err = validator
            .validate("s1", "../../etc/passwd", AccessMode::Read)
            .unwrap_err();
        match &err {
            LoomError::SecurityViolation { kind } => assert_eq!(*kind, ViolationKind::Traversal),
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(!msg.contains("etc"));
        assert!(!msg.contains("passwd"));

        // The rejection is on the audit trail.
        let recent = audit.recent(5);
        assert!(recent
            .iter()
            .any(|r| r.kind == AuditKind::SecurityViolation && r.detail.contains("traversal")));
    }

    #[test]
    fn inside_allowlist_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (_, validator) = validator(dir.path());

        let canonical = validator
            .validate("s1", "src/lib.rs", AccessMode::Read)
            .unwrap();
        assert!(canonical.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn outside_allowlist_is_whitelist_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (_, validator) = validator(dir.path());

        let err = validator
            .validate("s1", "/somewhere/else/file.txt", AccessMode::Write)
            .unwrap_err();
        assert!(matches!(
            err,
            LoomError::SecurityViolation {
                kind: ViolationKind::Whitelist
            }
        ));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, validator) = validator(dir.path());

        let long = "a/".repeat(MAX_PATH_LEN);
        for bad in ["~/secret", "file\0name", "we|rd", long.as_str()] {
            let err = validator.validate("s1", bad, AccessMode::Read).unwrap_err();
            assert!(matches!(
                err,
                LoomError::SecurityViolation {
                    kind: ViolationKind::Malformed
                }
            ));
        }
    }

    #[test]
    fn symlink_rejected_when_disallowed() {
        let dir = tempfile::tempdir().unwrap();
        let (_, validator) = validator(dir.path());

        let target = dir.path().join("real.txt");
        std::fs::write(&target, "x").unwrap();
        let link = dir.path().join("link.txt");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();

        #[cfg(unix)]
        {
            let err = validator
                .validate("s1", link.to_str().unwrap(), AccessMode::Read)
                .unwrap_err();
            assert!(matches!(
                err,
                LoomError::SecurityViolation {
                    kind: ViolationKind::Symlink
                }
            ));
        }
    }

    #[test]
    fn extension_allowlist_enforced_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().join("logs")));
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let config = SecurityConfig {
            allowed_directories: vec![dir.path().to_string_lossy().to_string()],
            allowed_extensions: vec!["json".to_string()],
            ..Default::default()
        };
        let validator = PathValidator::new(&config, audit);

        assert!(validator.validate("s1", "data.json", AccessMode::Read).is_ok());
        assert!(validator.validate("s1", "data.yaml", AccessMode::Read).is_err());
    }
}
