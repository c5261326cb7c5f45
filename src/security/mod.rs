//! Security gatekeeper: path validation, resource locks, input sanitation,
//! audit trail, and authN/Z. Every system boundary goes through here.

pub mod audit;
pub mod auth;
pub mod locks;
pub mod path_validator;
pub mod sanitizer;

pub use audit::{AuditKind, AuditLogger, AuditSeverity};
pub use auth::{AuthService, AuthSession};
pub use locks::{LockHandle, LockManager};
pub use path_validator::{AccessMode, PathValidator};
pub use sanitizer::{DataSanitizer, SanitizeOutcome};

use crate::config::LoomConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Bundles the gatekeeper services; built once at startup and shared.
pub struct SecurityGateway {
    pub audit: Arc<AuditLogger>,
    pub auth: Arc<AuthService>,
    pub locks: LockManager,
    pub paths: PathValidator,
    pub sanitizer: DataSanitizer,
}

impl SecurityGateway {
    pub fn new(config: &LoomConfig) -> Self {
        let logs_dir = PathBuf::from(&config.data_dir).join("logs");
        let audit = Arc::new(AuditLogger::new(logs_dir));
        let auth = Arc::new(AuthService::new(audit.clone()));
        let locks = LockManager::new(Duration::from_secs(config.security.lock_ttl_secs));
        let paths = PathValidator::new(&config.security, audit.clone());
        let sanitizer = DataSanitizer::new(audit.clone());

        Self {
            audit,
            auth,
            locks,
            paths,
            sanitizer,
        }
    }
}
