//! Agent response processing: validates completions, finalises task and job
//! state, releases the agent, and broadcasts results.
//!
//! Validation and history persistence are mandatory; every later step is
//! best-effort so one failing side-effect never blocks task finalisation.

use crate::agents::{AgentRegistry, TaskQueues};
use crate::jobs::JobRegistry;
use crate::models::{
    AgentTaskResponse, JobStatus, ResponseStatus, TaskStatus, TransportKind,
};
use crate::notifications::NotificationBus;
use crate::orchestrator::ExecutionTracker;
use crate::storage::StorageEngine;
use crate::{LoomError, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub task_id: String,
    pub task_status: TaskStatus,
    pub processed_at: chrono::DateTime<Utc>,
    /// Names of best-effort steps that failed (logged, not fatal).
    pub degraded_steps: Vec<String>,
}

pub struct ResponseProcessor {
    storage: StorageEngine,
    jobs: Arc<JobRegistry>,
    bus: Arc<NotificationBus>,
    registry: Arc<AgentRegistry>,
    queues: Arc<TaskQueues>,
    tracker: Arc<ExecutionTracker>,
    history: DashMap<String, AgentTaskResponse>,
}

impl ResponseProcessor {
    pub fn new(
        storage: StorageEngine,
        jobs: Arc<JobRegistry>,
        bus: Arc<NotificationBus>,
        registry: Arc<AgentRegistry>,
        queues: Arc<TaskQueues>,
        tracker: Arc<ExecutionTracker>,
    ) -> Self {
        Self {
            storage,
            jobs,
            bus,
            registry,
            queues,
            tracker,
            history: DashMap::new(),
        }
    }

    /// Response history by task id; resubmission overwrites.
    pub fn history(&self, task_id: &str) -> Option<AgentTaskResponse> {
        self.history.get(task_id).map(|r| r.clone())
    }

    pub async fn process(&self, mut response: AgentTaskResponse) -> Result<ProcessReport> {
        // 1. Validation: agent, task, ownership, body.
        if response.response.trim().is_empty() {
            return Err(LoomError::Validation("response body is empty".to_string()));
        }
        let agent = self
            .registry
            .get(&response.agent_id)
            .ok_or_else(|| LoomError::NotFound(format!("agent {}", response.agent_id)))?;
        let task = self.storage.get_task(&response.task_id).await?;
        if task.assigned_agent.as_deref() != Some(response.agent_id.as_str()) {
            return Err(LoomError::Validation(format!(
                "task {} is not assigned to agent {}",
                response.task_id, response.agent_id
            )));
        }

        response.received_at = Utc::now();

        // 2. Persist in history (mandatory; overwrites resubmissions).
        self.history
            .insert(response.task_id.clone(), response.clone());

        let mut degraded = Vec::new();
        let task_status = response.status.as_task_status();

        // 3. Task state and completion metadata.
        if let Err(e) = self.update_task(&response, task_status).await {
            warn!(task_id = %response.task_id, "task update failed: {e}");
            degraded.push("task_update".to_string());
        }

        // 4. Job result (terminal for DONE/ERROR, progress for PARTIAL).
        if let Err(e) = self.update_job(&response) {
            warn!(task_id = %response.task_id, "job update failed: {e}");
            degraded.push("job_update".to_string());
        }

        // 5. Release the agent side.
        if response.status.is_terminal() {
            self.queues.remove_task(&response.task_id);
            let duration_ms = response
                .completion_details
                .as_ref()
                .and_then(|d| d.duration_ms)
                .unwrap_or_else(|| {
                    (Utc::now() - task.updated_at).num_milliseconds().max(0) as u64
                });
            if let Err(e) = self.registry.task_finished(
                &response.agent_id,
                &response.task_id,
                response.status == ResponseStatus::Done,
                duration_ms,
            ) {
                warn!(agent_id = %response.agent_id, "agent release failed: {e}");
                degraded.push("agent_release".to_string());
            }
        }
        if let Err(e) = self.registry.update_heartbeat(&response.agent_id) {
            debug!(agent_id = %response.agent_id, "heartbeat refresh failed: {e}");
        }

        // 6. Notifications.
        if response.status == ResponseStatus::Partial {
            self.bus.broadcast(
                "progress",
                &serde_json::json!({
                    "jobId": response.task_id,
                    "status": "running",
                    "message": format!("partial: {}", truncate(&response.response, 120)),
                }),
            );
        }
        if response.status.is_terminal() {
            let files_modified = response
                .completion_details
                .as_ref()
                .map(|d| d.files_modified.clone())
                .unwrap_or_default();
            let execution_time = response
                .completion_details
                .as_ref()
                .and_then(|d| d.duration_ms)
                .unwrap_or_default();
            self.bus.broadcast(
                "taskCompleted",
                &serde_json::json!({
                    "agentId": response.agent_id,
                    "taskId": response.task_id,
                    "status": response.status,
                    "completedAt": response.received_at,
                    "success": response.status == ResponseStatus::Done,
                    "executionTime": execution_time,
                    "filesModified": files_modified,
                }),
            );
        }
        if agent.transport == TransportKind::Sse {
            if let Some(session) = agent.session_id.as_deref() {
                self.bus.send(
                    session,
                    "responseReceived",
                    &serde_json::json!({
                        "taskId": response.task_id,
                        "acknowledged": true,
                        "nextAction": "ready_for_new_task",
                        "timestamp": Utc::now(),
                    }),
                );
            }
        }

        // Unblock any awaiting execution last, once state is consistent.
        self.tracker
            .complete_task(&response.task_id, response.clone());

        info!(
            task_id = %response.task_id,
            agent_id = %response.agent_id,
            status = %response.status,
            "agent response processed"
        );

        Ok(ProcessReport {
            task_id: response.task_id,
            task_status,
            processed_at: Utc::now(),
            degraded_steps: degraded,
        })
    }

    async fn update_task(
        &self,
        response: &AgentTaskResponse,
        task_status: TaskStatus,
    ) -> Result<()> {
        let mut task = self.storage.get_task(&response.task_id).await?;
        task.status = task_status;
        task.agent_response = Some(response.clone());
        if task_status.is_terminal() {
            task.assigned_agent = None;
        }
        self.storage.update_task(task).await?;
        Ok(())
    }

    fn update_job(&self, response: &AgentTaskResponse) -> Result<()> {
        match response.status {
            ResponseStatus::Partial => self.jobs.set_progress(
                &response.task_id,
                JobStatus::Running,
                &format!("partial: {}", truncate(&response.response, 120)),
            ),
            terminal => self.jobs.set_result(
                &response.task_id,
                if terminal == ResponseStatus::Done {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                },
                serde_json::json!({
                    "success": terminal == ResponseStatus::Done,
                    "status": terminal,
                    "response": response.response,
                    "completionDetails": response.completion_details,
                    "processedAt": Utc::now(),
                }),
            ),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
