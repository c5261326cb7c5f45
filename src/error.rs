use thiserror::Error;

/// Convenience type alias for Results with LoomError
pub type Result<T> = std::result::Result<T, LoomError>;

/// Path validation failure categories.
///
/// The variant never carries the offending path: validation errors are
/// surfaced to callers and must not echo probed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Traversal,
    Whitelist,
    Symlink,
    Malformed,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Traversal => "traversal",
            ViolationKind::Whitelist => "whitelist",
            ViolationKind::Symlink => "symlink",
            ViolationKind::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

/// Coarse error classification used at the system boundary.
///
/// Maps one-to-one onto the HTTP status and the tool-call `errorDetails.code`
/// a caller receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    SecurityViolation,
    Auth,
    Conflict,
    RateLimited,
    Transport,
    Timeout,
    Cancelled,
    StorageFailure,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::Auth => "auth",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Main error type for taskloom.
///
/// Every fallible operation in the crate returns this enum; the variants
/// follow the system error taxonomy so callers can branch on `kind()`
/// without string matching.
#[derive(Error, Debug)]
pub enum LoomError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict on {resource}: held by {holder}")]
    Conflict { resource: String, holder: String },

    #[error("security violation: {kind}")]
    SecurityViolation { kind: ViolationKind },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("rate limited: retry in {wait_ms} ms")]
    RateLimited { wait_ms: u64 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        tag: Option<&'static str>,
    },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("storage failure: {message}")]
    StorageFailure { message: String },

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("job {job_id} is terminal but has no stored result")]
    MissingJobResult { job_id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoomError::Validation(_) => ErrorKind::Validation,
            LoomError::NotFound(_) => ErrorKind::NotFound,
            LoomError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            LoomError::Conflict { .. } => ErrorKind::Conflict,
            LoomError::SecurityViolation { .. } => ErrorKind::SecurityViolation,
            LoomError::Unauthorized | LoomError::Forbidden { .. } => ErrorKind::Auth,
            LoomError::RateLimited { .. } => ErrorKind::RateLimited,
            LoomError::Transport { .. } | LoomError::HttpClient(_) => ErrorKind::Transport,
            LoomError::Timeout { .. } => ErrorKind::Timeout,
            LoomError::Cancelled => ErrorKind::Cancelled,
            LoomError::StorageFailure { .. } | LoomError::Io(_) => ErrorKind::StorageFailure,
            LoomError::QueueFull(_) => ErrorKind::Conflict,
            LoomError::MissingJobResult { .. } => ErrorKind::Internal,
            LoomError::Serialization(_) => ErrorKind::Validation,
            LoomError::Config(_) => ErrorKind::Validation,
            LoomError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors the orchestrator may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Transport | ErrorKind::RateLimited
        )
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        LoomError::StorageFailure {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        LoomError::Transport {
            message: message.into(),
            tag: None,
        }
    }
}
