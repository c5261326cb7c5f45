//! System-wide tuning values.
//!
//! Anything a deployment is expected to change lives in `config`; these are
//! the fixed internals.

/// Maximum pending tasks in the global unassigned pool.
pub const MAX_UNASSIGNED_POOL: usize = 1000;

/// Multiplier applied to an agent's `max_concurrent_tasks` to bound its queue.
pub const QUEUE_BACKLOG_FACTOR: usize = 4;

/// Capacity of each session's notification send queue.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// Capacity of the storage event broadcast channel.
pub const STORAGE_EVENT_CAPACITY: usize = 1024;

/// Upper bound on concurrently tracked executions before backpressure.
pub const MAX_PENDING_EXECUTIONS: usize = 512;

/// Bounded history kept by the audit logger's in-memory ring.
pub const AUDIT_RING_CAPACITY: usize = 4096;

/// Audit JSONL file is rotated and archived past this size.
pub const AUDIT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Failed-auth cluster rule: this many failures from one actor...
pub const SUSPICIOUS_AUTH_FAILURES: usize = 5;
/// ...within this window flag suspicious activity.
pub const SUSPICIOUS_AUTH_WINDOW_SECS: i64 = 60;

/// File relevance scoring processes inputs in chunks of this size.
pub const FILE_SCORE_CHUNK_SIZE: usize = 20;

/// Worker pool (and semaphore) size for chunked scoring.
pub const CHUNK_WORKER_POOL: usize = 4;

/// Children produced by one decomposition step.
pub const MIN_DECOMPOSED_TASKS: usize = 2;
pub const MAX_DECOMPOSED_TASKS: usize = 10;

/// Title similarity at or above this is treated as a duplicate.
pub const DUPLICATE_JACCARD_THRESHOLD: f64 = 0.8;

/// An LLM scoring reply covering less than this fraction of the expected
/// items is treated as incomplete and retried once.
pub const LLM_MIN_COVERAGE: f64 = 0.8;

/// Polling step while waiting on a contended lock.
pub const LOCK_POLL_INTERVAL_MS: u64 = 10;

/// Heartbeat sweeper cadence.
pub const HEARTBEAT_SWEEP_INTERVAL_SECS: u64 = 10;

/// Job eviction sweeper cadence.
pub const JOB_SWEEP_INTERVAL_SECS: u64 = 60;

/// Monitoring snapshot cadence and history depth.
pub const MONITOR_INTERVAL_SECS: u64 = 30;
pub const MONITOR_HISTORY_CAPACITY: usize = 120;

/// HTTP surface quotas, per minute.
pub const REQUESTS_PER_MINUTE: u32 = 120;
pub const DELIVERY_REQUESTS_PER_MINUTE: u32 = 30;

/// Transport delivery retries back off exponentially from the base, capped
/// per wait, until the task deadline.
pub const DELIVERY_BACKOFF_BASE_MS: u64 = 250;
pub const DELIVERY_BACKOFF_MAX_MS: u64 = 30_000;
/// Retry budget for descriptors that carry no deadline.
pub const DELIVERY_FALLBACK_BUDGET_MS: u64 = 30_000;

/// Minted bearer tokens are this many hex characters.
pub const TOKEN_HEX_LEN: usize = 64;

/// Paths longer than this are rejected as malformed.
pub const MAX_PATH_LEN: usize = 4096;
