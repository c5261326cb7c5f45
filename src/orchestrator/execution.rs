use super::delivery::DeliveryRouter;
use super::selection::select_agent;
use crate::agents::{AgentRegistry, TaskQueues};
use crate::config::{OrchestratorConfig, TimeoutConfig};
use crate::constants::MAX_PENDING_EXECUTIONS;
use crate::jobs::JobRegistry;
use crate::models::{
    AgentState, AgentTaskResponse, Assignment, AssignmentState, AtomicTask, JobStatus,
    ResponseStatus, TaskDescriptor, TaskStatus,
};
use crate::notifications::NotificationBus;
use crate::security::locks::LockManager;
use crate::storage::StorageEngine;
use crate::{LoomError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signals that can end (or extend) a wait on an agent.
#[derive(Debug)]
pub enum ExecutionSignal {
    Response(AgentTaskResponse),
    Cancelled,
    AgentLost,
}

struct PendingEntry {
    task_id: String,
    agent_id: String,
    tx: mpsc::Sender<ExecutionSignal>,
}

/// Concurrent map of in-flight executions keyed by execution id.
///
/// The response processor and the heartbeat sweeper complete entries; the
/// orchestrator awaits them.
pub struct ExecutionTracker {
    pending: DashMap<String, PendingEntry>,
    by_task: DashMap<String, String>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            by_task: DashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn register(
        &self,
        execution_id: &str,
        task_id: &str,
        agent_id: &str,
    ) -> mpsc::Receiver<ExecutionSignal> {
        let (tx, rx) = mpsc::channel(4);
        self.pending.insert(
            execution_id.to_string(),
            PendingEntry {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                tx,
            },
        );
        self.by_task
            .insert(task_id.to_string(), execution_id.to_string());
        rx
    }

    pub fn deregister(&self, execution_id: &str) {
        if let Some((_, entry)) = self.pending.remove(execution_id) {
            self.by_task.remove(&entry.task_id);
        }
    }

    fn signal(&self, execution_id: &str, signal: ExecutionSignal) -> bool {
        match self.pending.get(execution_id) {
            Some(entry) => entry.tx.try_send(signal).is_ok(),
            None => false,
        }
    }

    /// Route an agent response to whoever awaits this task.
    pub fn complete_task(&self, task_id: &str, response: AgentTaskResponse) -> bool {
        let Some(execution_id) = self.by_task.get(task_id).map(|e| e.clone()) else {
            return false;
        };
        self.signal(&execution_id, ExecutionSignal::Response(response))
    }

    pub fn cancel(&self, execution_id: &str) -> bool {
        self.signal(execution_id, ExecutionSignal::Cancelled)
    }

    /// Abort every pending execution owned by a lost agent.
    pub fn abort_for_agent(&self, agent_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .map(|e| e.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.signal(id, ExecutionSignal::AgentLost))
            .count()
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_id: String,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub queued: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub assignment: Option<Assignment>,
    pub result: Option<serde_json::Value>,
    pub metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the configured task execution timeout.
    pub timeout_secs: Option<u64>,
    /// Waives the dependency-satisfaction check.
    pub force: bool,
}

/// The assignment half of the orchestrator: matches tasks to agents,
/// delivers them, and awaits the response.
pub struct Orchestrator {
    config: OrchestratorConfig,
    timeouts: TimeoutConfig,
    storage: StorageEngine,
    locks: LockManager,
    registry: Arc<AgentRegistry>,
    queues: Arc<TaskQueues>,
    jobs: Arc<JobRegistry>,
    bus: Arc<NotificationBus>,
    tracker: Arc<ExecutionTracker>,
    delivery: Arc<DeliveryRouter>,
    round_robin: AtomicUsize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        timeouts: TimeoutConfig,
        storage: StorageEngine,
        locks: LockManager,
        registry: Arc<AgentRegistry>,
        queues: Arc<TaskQueues>,
        jobs: Arc<JobRegistry>,
        bus: Arc<NotificationBus>,
        tracker: Arc<ExecutionTracker>,
        delivery: Arc<DeliveryRouter>,
    ) -> Self {
        Self {
            config,
            timeouts,
            storage,
            locks,
            registry,
            queues,
            jobs,
            bus,
            tracker,
            delivery,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn tracker(&self) -> Arc<ExecutionTracker> {
        self.tracker.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Rank the registered agents for a task; None when nobody qualifies.
    pub fn find_best_agent(&self, task: &AtomicTask) -> Option<String> {
        let agents = self.registry.list();
        let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
        select_agent(&agents, task, &self.config, cursor)
    }

    /// Run one task through the full assignment pipeline.
    pub async fn execute_task(&self, task_id: &str, options: ExecuteOptions) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let execution_id = Uuid::new_v4().to_string();

        // 1. Validation.
        if task_id.trim().is_empty() {
            return Err(LoomError::Validation("task id must be non-empty".to_string()));
        }
        let task = self.storage.get_task(task_id).await?;
        if !self.storage.project_exists(&task.project_id).await? {
            return Err(LoomError::Validation(format!(
                "task {task_id} references unknown project"
            )));
        }
        match task.status {
            TaskStatus::Pending | TaskStatus::Blocked => {}
            TaskStatus::InProgress => {
                return Err(LoomError::Conflict {
                    resource: format!("task:{task_id}"),
                    holder: task.assigned_agent.unwrap_or_default(),
                })
            }
            status => {
                return Err(LoomError::Validation(format!(
                    "task {task_id} is already {status:?}"
                )))
            }
        }
        if !options.force {
            self.check_dependencies(&task).await?;
        }

        // 2. Per-task lock for the assignment phase.
        let lock = self
            .locks
            .acquire(
                &format!("task:{task_id}"),
                &execution_id,
                Duration::from_secs(self.timeouts.lock_secs),
            )
            .await?;

        // 3. Agent selection.
        let timeout_secs = options.timeout_secs.unwrap_or(self.timeouts.task_execution_secs);
        let deadline = Utc::now() + ChronoDuration::seconds(timeout_secs as i64);
        let descriptor = TaskDescriptor::from_task(&task, Some(deadline));

        let Some(agent_id) = self.find_best_agent(&task) else {
            self.queues.push_unassigned(descriptor)?;
            info!(task_id, "no agent available, task parked as unassigned");
            return Ok(ExecutionOutcome {
                status: ExecutionStatus::Queued,
                queued: true,
                message: Some("no suitable agent available; task queued".to_string()),
                error: None,
                assignment: None,
                result: None,
                metadata: ExecutionMetadata {
                    execution_id,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                },
            });
        };
        let agent = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))?;

        if self.tracker.pending_count() >= MAX_PENDING_EXECUTIONS {
            self.bus.broadcast(
                "backpressure",
                &serde_json::json!({"component": "orchestrator", "pending": self.tracker.pending_count()}),
            );
            return Err(LoomError::QueueFull("pending executions".to_string()));
        }

        // 4. Assignment bookkeeping.
        let mut assignment = Assignment::new(task_id, &agent_id, deadline);
        self.bus.broadcast(
            "assignment",
            &serde_json::json!({
                "executionId": execution_id,
                "taskId": task_id,
                "agentId": agent_id,
                "deadline": deadline,
            }),
        );
        self.queues
            .add_task(&agent_id, descriptor.clone(), agent.config.max_concurrent_tasks)?;
        self.registry.task_started(&agent_id, task_id)?;

        let mut in_progress = task.clone();
        in_progress.status = TaskStatus::InProgress;
        in_progress.assigned_agent = Some(agent_id.clone());
        self.storage.update_task(in_progress).await?;

        if self
            .jobs
            .create_with_id(task_id, "execute-task", serde_json::json!({"agentId": agent_id}))
            .is_err()
        {
            debug!(task_id, "job already open for task, reusing");
        }
        let _ = self
            .jobs
            .set_progress(task_id, JobStatus::Running, &format!("assigned to {agent_id}"));
        self.bus.broadcast(
            "progress",
            &serde_json::json!({
                "jobId": task_id,
                "status": "running",
                "message": format!("assigned to {agent_id}"),
            }),
        );

        // Track before delivering so a fast response cannot slip past the
        // awaiter.
        let mut rx = self.tracker.register(&execution_id, task_id, &agent_id);

        // 5. Delivery.
        if let Err(e) = self.delivery.deliver(&agent, &descriptor).await {
            warn!(task_id, agent_id = %agent.id, "delivery failed: {e}");
            self.tracker.deregister(&execution_id);
            assignment.state = AssignmentState::Failed;
            self.release_assignment(task_id, &agent_id, TaskStatus::Failed).await;
            let _ = self.jobs.set_result(
                task_id,
                JobStatus::Failed,
                serde_json::json!({"error": "Task delivery failed"}),
            );
            return Ok(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                queued: false,
                message: None,
                error: Some("Task delivery failed".to_string()),
                assignment: Some(assignment),
                result: None,
                metadata: ExecutionMetadata {
                    execution_id,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                },
            });
        }
        assignment.state = AssignmentState::Delivered;

        // 6. Await the response; the lock does not outlive the assignment phase.
        drop(lock);

        let wait_budget = Duration::from_secs(timeout_secs);
        let outcome = self
            .await_completion(&mut rx, wait_budget, &execution_id, &mut assignment, &agent_id)
            .await;
        self.tracker.deregister(&execution_id);

        let mut outcome = outcome;
        outcome.metadata = ExecutionMetadata {
            execution_id,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        Ok(outcome)
    }

    async fn await_completion(
        &self,
        rx: &mut mpsc::Receiver<ExecutionSignal>,
        budget: Duration,
        execution_id: &str,
        assignment: &mut Assignment,
        agent_id: &str,
    ) -> ExecutionOutcome {
        let deadline = tokio::time::Instant::now() + budget;
        let task_id = assignment.task_id.clone();

        loop {
            let signal = tokio::time::timeout_at(deadline, rx.recv()).await;
            match signal {
                Ok(Some(ExecutionSignal::Response(response))) => match response.status {
                    ResponseStatus::Partial => {
                        debug!(task_id = %task_id, "partial response, continuing to wait");
                        assignment.state = AssignmentState::Executing;
                        continue;
                    }
                    terminal => {
                        let completed = terminal == ResponseStatus::Done;
                        assignment.state = if completed {
                            AssignmentState::Completed
                        } else {
                            AssignmentState::Failed
                        };
                        info!(task_id = %task_id, execution_id, status = %terminal, "execution finished");
                        return self.outcome_from_response(assignment.clone(), response);
                    }
                },
                Ok(Some(ExecutionSignal::Cancelled)) => {
                    assignment.state = AssignmentState::Cancelled;
                    self.release_assignment(&task_id, agent_id, TaskStatus::Pending).await;
                    let _ = self.jobs.set_result(
                        &task_id,
                        JobStatus::Failed,
                        serde_json::json!({"status": "cancelled"}),
                    );
                    if let Some(agent) = self.registry.get(agent_id) {
                        self.delivery.send_cancel(&agent, &task_id).await;
                    }
                    return self.plain_outcome(
                        ExecutionStatus::Cancelled,
                        assignment.clone(),
                        None,
                    );
                }
                Ok(Some(ExecutionSignal::AgentLost)) => {
                    warn!(task_id = %task_id, agent_id, "agent lost during execution");
                    assignment.state = AssignmentState::Failed;
                    self.release_assignment(&task_id, agent_id, TaskStatus::Pending).await;
                    let _ = self.jobs.set_result(
                        &task_id,
                        JobStatus::Failed,
                        serde_json::json!({"error": "agent_lost"}),
                    );
                    return self.plain_outcome(
                        ExecutionStatus::Failed,
                        assignment.clone(),
                        Some("agent_lost".to_string()),
                    );
                }
                Ok(None) => {
                    assignment.state = AssignmentState::Failed;
                    return self.plain_outcome(
                        ExecutionStatus::Failed,
                        assignment.clone(),
                        Some("execution channel closed".to_string()),
                    );
                }
                Err(_) => {
                    warn!(task_id = %task_id, execution_id, "execution timed out");
                    assignment.state = AssignmentState::TimedOut;
                    self.release_assignment(&task_id, agent_id, TaskStatus::Failed).await;
                    let _ = self.jobs.set_result(
                        &task_id,
                        JobStatus::Failed,
                        serde_json::json!({"error": "timeout"}),
                    );
                    return self.plain_outcome(
                        ExecutionStatus::TimedOut,
                        assignment.clone(),
                        Some("execution timed out".to_string()),
                    );
                }
            }
        }
    }

    fn outcome_from_response(
        &self,
        assignment: Assignment,
        response: AgentTaskResponse,
    ) -> ExecutionOutcome {
        let status = if response.status == ResponseStatus::Done {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let result = serde_json::json!({
            "success": response.status == ResponseStatus::Done,
            "status": response.status,
            "response": response.response,
            "completionDetails": response.completion_details,
        });
        ExecutionOutcome {
            status,
            queued: false,
            message: None,
            error: (status == ExecutionStatus::Failed).then(|| response.response.clone()),
            assignment: Some(assignment),
            result: Some(result),
            metadata: ExecutionMetadata {
                execution_id: String::new(),
                total_duration_ms: 0,
            },
        }
    }

    fn plain_outcome(
        &self,
        status: ExecutionStatus,
        assignment: Assignment,
        error: Option<String>,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            queued: false,
            message: None,
            error,
            assignment: Some(assignment),
            result: None,
            metadata: ExecutionMetadata {
                execution_id: String::new(),
                total_duration_ms: 0,
            },
        }
    }

    /// Undo assignment-side state for a task that will not complete through
    /// the response processor. Best-effort.
    async fn release_assignment(&self, task_id: &str, agent_id: &str, task_status: TaskStatus) {
        self.queues.remove_queued(task_id);
        let _ = self.registry.update(agent_id, |a| {
            a.current_tasks.retain(|t| t != task_id);
            if a.state == AgentState::Busy && a.current_tasks.len() < a.config.max_concurrent_tasks
            {
                a.state = AgentState::Idle;
            }
        });
        match self.storage.try_get_task(task_id).await {
            Ok(Some(mut task)) => {
                task.status = task_status;
                if task_status == TaskStatus::Pending {
                    task.assigned_agent = None;
                }
                if let Err(e) = self.storage.update_task(task).await {
                    warn!(task_id, "failed to restore task state: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task_id, "failed to read task during release: {e}"),
        }
    }

    /// Cooperative cancellation of an in-flight execution.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        if self.tracker.cancel(execution_id) {
            Ok(())
        } else {
            Err(LoomError::NotFound(format!("execution {execution_id}")))
        }
    }

    /// Opportunistically re-dispatch parked descriptors to free agents.
    pub fn kick_unassigned(self: &Arc<Self>) {
        let drained = self.queues.drain_unassigned(16);
        for descriptor in drained {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                let task_id = descriptor.task_id.clone();
                match orchestrator
                    .execute_task(&task_id, ExecuteOptions::default())
                    .await
                {
                    Ok(outcome) if outcome.queued => {
                        debug!(task_id, "task re-parked, still no agent");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(task_id, "unassigned redispatch failed: {e}"),
                }
            });
        }
    }

    async fn check_dependencies(&self, task: &AtomicTask) -> Result<()> {
        for dep_id in &task.depends_on {
            let dep = self.storage.get_task(dep_id).await.map_err(|_| {
                LoomError::Validation(format!(
                    "task {} depends on unknown task {dep_id}",
                    task.id
                ))
            })?;
            if dep.status != TaskStatus::Completed {
                return Err(LoomError::Validation(format!(
                    "task {} has unsatisfied dependency {dep_id}",
                    task.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompletionDetails;

    fn response(task_id: &str, status: ResponseStatus) -> AgentTaskResponse {
        AgentTaskResponse {
            agent_id: "a1".to_string(),
            task_id: task_id.to_string(),
            status,
            response: "done".to_string(),
            completion_details: Some(CompletionDetails::default()),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tracker_routes_response_by_task() {
        let tracker = ExecutionTracker::new();
        let mut rx = tracker.register("ex1", "t1", "a1");

        assert!(tracker.complete_task("t1", response("t1", ResponseStatus::Done)));
        match rx.recv().await.unwrap() {
            ExecutionSignal::Response(r) => assert_eq!(r.task_id, "t1"),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tracker_cancel_and_deregister() {
        let tracker = ExecutionTracker::new();
        let mut rx = tracker.register("ex1", "t1", "a1");

        assert!(tracker.cancel("ex1"));
        assert!(matches!(rx.recv().await.unwrap(), ExecutionSignal::Cancelled));

        tracker.deregister("ex1");
        assert!(!tracker.cancel("ex1"));
        assert!(!tracker.complete_task("t1", response("t1", ResponseStatus::Done)));
    }

    #[tokio::test]
    async fn abort_for_agent_hits_only_that_agent() {
        let tracker = ExecutionTracker::new();
        let mut rx1 = tracker.register("ex1", "t1", "a1");
        let mut rx2 = tracker.register("ex2", "t2", "a2");

        assert_eq!(tracker.abort_for_agent("a1"), 1);
        assert!(matches!(rx1.recv().await.unwrap(), ExecutionSignal::AgentLost));
        assert!(rx2.try_recv().is_err());
    }
}
