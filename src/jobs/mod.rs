//! Long-running job registry with adaptive poll rate limiting.
//!
//! Every long-running tool invocation opens a job; clients poll it, and the
//! registry pushes the allowed poll interval from 1 s toward 5 s while the
//! job runs. Terminal jobs poll freely and are swept after a retention
//! window.

use crate::config::JobConfig;
use crate::constants::JOB_SWEEP_INTERVAL_SECS;
use crate::models::{Job, JobStatus};
use crate::{LoomError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// What a rate-limited poll returns.
///
/// When `should_wait` is set no job data is returned; the caller defers for
/// `wait_ms` and retries.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub job: Option<Job>,
    pub wait_ms: u64,
    pub should_wait: bool,
    pub poll_interval_ms: u64,
}

struct JobEntry {
    job: Job,
    poll_interval_ms: u64,
    next_poll_at: DateTime<Utc>,
}

pub struct JobRegistry {
    entries: DashMap<String, JobEntry>,
    config: JobConfig,
}

impl JobRegistry {
    pub fn new(config: JobConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Open a job with a fresh id.
    pub fn create(&self, tool_name: &str, params: serde_json::Value) -> String {
        let id = Uuid::new_v4().to_string();
        self.insert_job(Job::new(&id, tool_name, params));
        id
    }

    /// Open a job under a caller-chosen id (task executions use the task id).
    pub fn create_with_id(
        &self,
        id: &str,
        tool_name: &str,
        params: serde_json::Value,
    ) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(LoomError::AlreadyExists(format!("job {id}")));
        }
        self.insert_job(Job::new(id, tool_name, params));
        Ok(())
    }

    fn insert_job(&self, job: Job) {
        debug!(job_id = %job.id, tool = %job.tool_name, "job created");
        self.entries.insert(
            job.id.clone(),
            JobEntry {
                job,
                poll_interval_ms: self.config.poll_min_interval_ms,
                next_poll_at: Utc::now(),
            },
        );
    }

    /// Update status and progress text.
    ///
    /// Idempotent per `(job, message)` pair: repeating the same progress does
    /// not advance `updated_at`.
    pub fn set_progress(&self, job_id: &str, status: JobStatus, message: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| LoomError::NotFound(format!("job {job_id}")))?;

        if entry.job.status == status && entry.job.progress_message.as_deref() == Some(message) {
            return Ok(());
        }
        entry.job.status = status;
        entry.job.progress_message = Some(message.to_string());
        entry.job.updated_at = Utc::now();
        Ok(())
    }

    /// Store the final result and flip the job terminal.
    ///
    /// Idempotent once terminal: later calls are ignored.
    pub fn set_result(
        &self,
        job_id: &str,
        status: JobStatus,
        result: serde_json::Value,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(LoomError::Validation(
                "set_result requires a terminal status".to_string(),
            ));
        }
        let mut entry = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| LoomError::NotFound(format!("job {job_id}")))?;

        if entry.job.status.is_terminal() {
            return Ok(());
        }
        entry.job.status = status;
        entry.job.result = Some(result);
        entry.job.updated_at = Utc::now();
        // Terminal jobs are no longer rate limited.
        entry.poll_interval_ms = 0;
        entry.next_poll_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.entries.get(job_id).map(|e| e.job.clone())
    }

    /// Poll under the adaptive rate limit.
    ///
    /// An early poll neither returns data nor advances `last_accessed_at`.
    pub fn get_with_rate_limit(&self, job_id: &str) -> Result<PollOutcome> {
        let now = Utc::now();
        let mut entry = match self.entries.get_mut(job_id) {
            Some(entry) => entry,
            None => {
                return Ok(PollOutcome {
                    job: None,
                    wait_ms: 0,
                    should_wait: false,
                    poll_interval_ms: 0,
                })
            }
        };

        if entry.job.status.is_terminal() {
            if entry.job.result.is_none() {
                return Err(LoomError::MissingJobResult {
                    job_id: job_id.to_string(),
                });
            }
            entry.job.last_accessed_at = now;
            return Ok(PollOutcome {
                job: Some(entry.job.clone()),
                wait_ms: 0,
                should_wait: false,
                poll_interval_ms: 0,
            });
        }

        if now < entry.next_poll_at {
            let wait_ms = (entry.next_poll_at - now).num_milliseconds().max(0) as u64;
            return Ok(PollOutcome {
                job: None,
                wait_ms,
                should_wait: true,
                poll_interval_ms: entry.poll_interval_ms,
            });
        }

        // Honoured poll: move the access stamp, schedule the next window and
        // back the interval off toward the ceiling.
        entry.job.last_accessed_at = now;
        let current = entry.poll_interval_ms;
        entry.next_poll_at = now + ChronoDuration::milliseconds(current as i64);
        entry.poll_interval_ms = (current * 2).min(self.config.poll_max_interval_ms);

        Ok(PollOutcome {
            job: Some(entry.job.clone()),
            wait_ms: 0,
            should_wait: false,
            poll_interval_ms: current,
        })
    }

    /// Drop terminal jobs idle past the retention window; returns how many.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.retention_secs as i64);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.job.status.is_terminal()
                && entry.job.updated_at < cutoff
                && entry.job.last_accessed_at < cutoff)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            info!("evicted {removed} expired jobs");
        }
        removed
    }

    /// Supervised eviction loop; exits when the stop signal flips.
    pub async fn run_sweeper(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(JOB_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep(); }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("job sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(JobConfig::default())
    }

    #[test]
    fn create_and_get() {
        let jobs = registry();
        let id = jobs.create("decompose-task", serde_json::json!({"taskId": "t1"}));
        let job = jobs.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.tool_name, "decompose-task");
    }

    #[test]
    fn duplicate_explicit_id_rejected() {
        let jobs = registry();
        jobs.create_with_id("t1", "execute-task", serde_json::json!({})).unwrap();
        let err = jobs.create_with_id("t1", "execute-task", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, LoomError::AlreadyExists(_)));
    }

    #[test]
    fn first_poll_honoured_second_rate_limited() {
        let jobs = registry();
        let id = jobs.create("slow-tool", serde_json::json!({}));
        jobs.set_progress(&id, JobStatus::Running, "working").unwrap();

        let first = jobs.get_with_rate_limit(&id).unwrap();
        assert!(!first.should_wait);
        assert_eq!(first.poll_interval_ms, 1000);
        assert!(first.job.is_some());

        let second = jobs.get_with_rate_limit(&id).unwrap();
        assert!(second.should_wait);
        assert!(second.job.is_none());
        assert!(second.wait_ms > 800 && second.wait_ms <= 1000, "{}", second.wait_ms);
    }

    #[test]
    fn early_poll_does_not_advance_last_accessed() {
        let jobs = registry();
        let id = jobs.create("slow-tool", serde_json::json!({}));
        jobs.set_progress(&id, JobStatus::Running, "working").unwrap();

        jobs.get_with_rate_limit(&id).unwrap();
        let stamp = jobs.get(&id).unwrap().last_accessed_at;

        let denied = jobs.get_with_rate_limit(&id).unwrap();
        assert!(denied.should_wait);
        assert_eq!(jobs.get(&id).unwrap().last_accessed_at, stamp);
    }

    #[test]
    fn interval_backs_off_and_clamps() {
        let mut config = JobConfig::default();
        config.poll_min_interval_ms = 10;
        config.poll_max_interval_ms = 35;
        let jobs = JobRegistry::new(config);
        let id = jobs.create("slow-tool", serde_json::json!({}));

        let mut intervals = Vec::new();
        for _ in 0..4 {
            loop {
                let outcome = jobs.get_with_rate_limit(&id).unwrap();
                if !outcome.should_wait {
                    intervals.push(outcome.poll_interval_ms);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(outcome.wait_ms + 1));
            }
        }
        assert_eq!(intervals, vec![10, 20, 35, 35]);
    }

    #[test]
    fn terminal_job_polls_freely() {
        let jobs = registry();
        let id = jobs.create("tool", serde_json::json!({}));
        jobs.set_result(&id, JobStatus::Completed, serde_json::json!({"ok": true}))
            .unwrap();

        for _ in 0..3 {
            let outcome = jobs.get_with_rate_limit(&id).unwrap();
            assert!(!outcome.should_wait);
            assert!(outcome.job.is_some());
        }
    }

    #[test]
    fn terminal_without_result_is_distinct_error() {
        let jobs = registry();
        let id = jobs.create("tool", serde_json::json!({}));
        // Force the inconsistent state directly.
        jobs.entries.get_mut(&id).unwrap().job.status = JobStatus::Failed;

        let err = jobs.get_with_rate_limit(&id).unwrap_err();
        assert!(matches!(err, LoomError::MissingJobResult { .. }));
    }

    #[test]
    fn set_progress_idempotent_per_message() {
        let jobs = registry();
        let id = jobs.create("tool", serde_json::json!({}));
        jobs.set_progress(&id, JobStatus::Running, "step 1").unwrap();
        let stamp = jobs.get(&id).unwrap().updated_at;

        jobs.set_progress(&id, JobStatus::Running, "step 1").unwrap();
        assert_eq!(jobs.get(&id).unwrap().updated_at, stamp);

        jobs.set_progress(&id, JobStatus::Running, "step 2").unwrap();
        assert!(jobs.get(&id).unwrap().updated_at > stamp);
    }

    #[test]
    fn set_result_idempotent_once_terminal() {
        let jobs = registry();
        let id = jobs.create("tool", serde_json::json!({}));
        jobs.set_result(&id, JobStatus::Completed, serde_json::json!({"n": 1}))
            .unwrap();
        jobs.set_result(&id, JobStatus::Failed, serde_json::json!({"n": 2}))
            .unwrap();

        let job = jobs.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["n"], 1);
    }

    #[test]
    fn completed_jobs_always_carry_results() {
        let jobs = registry();
        let id = jobs.create("tool", serde_json::json!({}));
        jobs.set_result(&id, JobStatus::Completed, serde_json::json!({"ok": true}))
            .unwrap();
        let job = jobs.get(&id).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.result.is_some());
    }

    #[test]
    fn sweep_removes_only_expired_terminal_jobs() {
        let mut config = JobConfig::default();
        config.retention_secs = 0;
        let jobs = JobRegistry::new(config);

        let done = jobs.create("tool", serde_json::json!({}));
        jobs.set_result(&done, JobStatus::Completed, serde_json::json!({})).unwrap();
        let running = jobs.create("tool", serde_json::json!({}));
        jobs.set_progress(&running, JobStatus::Running, "busy").unwrap();

        // Make the terminal job look idle.
        {
            let mut entry = jobs.entries.get_mut(&done).unwrap();
            entry.job.updated_at = Utc::now() - ChronoDuration::seconds(10);
            entry.job.last_accessed_at = entry.job.updated_at;
        }

        assert_eq!(jobs.sweep(), 1);
        assert!(jobs.get(&done).is_none());
        assert!(jobs.get(&running).is_some());
    }
}
