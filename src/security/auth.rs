use super::audit::{AuditKind, AuditLogger, AuditSeverity};
use crate::constants::TOKEN_HEX_LEN;
use crate::{LoomError, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Sessions expire this long after authentication.
const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub session_id: String,
    pub user: String,
    pub role: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Role → capability matrix with token-based session validation.
///
/// Token comparison is constant-time so invalid-token timing reveals nothing
/// about stored values.
pub struct AuthService {
    matrix: HashMap<String, HashSet<String>>,
    sessions: DashMap<String, AuthSession>,
    tokens: DashMap<String, String>,
    audit: Arc<AuditLogger>,
}

impl AuthService {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            matrix: default_matrix(),
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            audit,
        }
    }

    pub fn with_matrix(mut self, matrix: HashMap<String, HashSet<String>>) -> Self {
        self.matrix = matrix;
        self
    }

    /// Mint a token-bearing session for `user` in `role`.
    pub fn authenticate(&self, user: &str, role: &str) -> Result<AuthSession> {
        if !self.matrix.contains_key(role) {
            self.audit.record(
                AuditKind::AuthFailure,
                AuditSeverity::Warning,
                Some(user),
                format!("unknown role {role}"),
            );
            return Err(LoomError::Validation(format!("unknown role: {role}")));
        }

        let now = Utc::now();
        let session = AuthSession {
            session_id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            role: role.to_string(),
            token: mint_token(),
            created_at: now,
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
        };

        self.tokens
            .insert(session.token.clone(), session.session_id.clone());
        self.sessions
            .insert(session.session_id.clone(), session.clone());

        self.audit.record(
            AuditKind::AuthSuccess,
            AuditSeverity::Info,
            Some(user),
            format!("role={role} session={}", session.session_id),
        );
        Ok(session)
    }

    /// Resolve a bearer token to its session.
    pub fn validate(&self, token: &str) -> Result<AuthSession> {
        // Constant-time scan over stored tokens; no early exit on prefix match.
        let mut matched: Option<String> = None;
        for entry in self.tokens.iter() {
            let equal: bool = entry.key().as_bytes().ct_eq(token.as_bytes()).into();
            if equal {
                matched = Some(entry.value().clone());
            }
        }

        let session = matched
            .and_then(|sid| self.sessions.get(&sid).map(|s| s.clone()))
            .filter(|s| s.expires_at > Utc::now());

        match session {
            Some(session) => Ok(session),
            None => {
                self.audit.record(
                    AuditKind::AuthFailure,
                    AuditSeverity::Warning,
                    Some("unknown"),
                    "invalid or expired token",
                );
                Err(LoomError::Unauthorized)
            }
        }
    }

    /// Check that `session`'s role grants `capability`.
    pub fn authorize(&self, session: &AuthSession, capability: &str) -> Result<()> {
        let granted = self
            .matrix
            .get(&session.role)
            .map(|caps| caps.contains("*") || caps.contains(capability))
            .unwrap_or(false);

        if granted {
            Ok(())
        } else {
            let reason = format!("role {} lacks capability {capability}", session.role);
            self.audit.record(
                AuditKind::AccessDenied,
                AuditSeverity::Warning,
                Some(&session.user),
                reason.clone(),
            );
            Err(LoomError::Forbidden { reason })
        }
    }

    pub fn revoke(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.tokens.remove(&session.token);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn default_matrix() -> HashMap<String, HashSet<String>> {
    let mut matrix = HashMap::new();
    matrix.insert(
        "admin".to_string(),
        ["*"].into_iter().map(String::from).collect(),
    );
    matrix.insert(
        "agent".to_string(),
        ["agent:register", "task:pickup", "task:respond", "heartbeat"]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    matrix.insert(
        "client".to_string(),
        ["task:submit", "task:deliver", "job:poll", "events:subscribe"]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, AuthService) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().to_path_buf()));
        (dir, AuthService::new(audit))
    }

    #[test]
    fn authenticate_then_validate_roundtrip() {
        let (_dir, auth) = service();
        let session = auth.authenticate("agent-7", "agent").unwrap();
        assert_eq!(session.token.len(), TOKEN_HEX_LEN);

        let resolved = auth.validate(&session.token).unwrap();
        assert_eq!(resolved.session_id, session.session_id);
        assert_eq!(resolved.role, "agent");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let (_dir, auth) = service();
        assert!(auth.authenticate("x", "superuser").is_err());
    }

    #[test]
    fn invalid_token_is_unauthorized() {
        let (_dir, auth) = service();
        auth.authenticate("agent-7", "agent").unwrap();
        let err = auth.validate("deadbeef").unwrap_err();
        assert!(matches!(err, LoomError::Unauthorized));
    }

    #[test]
    fn authorize_checks_matrix_with_reasoned_denial() {
        let (_dir, auth) = service();
        let session = auth.authenticate("agent-7", "agent").unwrap();

        assert!(auth.authorize(&session, "task:pickup").is_ok());
        let err = auth.authorize(&session, "task:deliver").unwrap_err();
        match err {
            LoomError::Forbidden { reason } => {
                assert!(reason.contains("task:deliver"));
            }
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn admin_wildcard_grants_everything() {
        let (_dir, auth) = service();
        let session = auth.authenticate("root", "admin").unwrap();
        assert!(auth.authorize(&session, "anything:at:all").is_ok());
    }

    #[test]
    fn revoked_session_stops_validating() {
        let (_dir, auth) = service();
        let session = auth.authenticate("agent-7", "agent").unwrap();
        auth.revoke(&session.session_id);
        assert!(auth.validate(&session.token).is_err());
    }
}
