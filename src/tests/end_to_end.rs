use crate::agents::HeartbeatSweeper;
use crate::config::LoomConfig;
use crate::llm::ScriptedCompletionClient;
use crate::models::{
    AgentRecord, AgentTaskResponse, AtomicTask, CompletionDetails, Epic, JobStatus, Project,
    ResponseStatus, TaskStatus, TaskType, TransportKind,
};
use crate::notifications::Frame;
use crate::orchestrator::{ExecuteOptions, ExecutionStatus};
use crate::transport::{handle_tool_call, ToolCall};
use crate::world::Loom;
use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

async fn world_with(replies: Vec<Result<String>>) -> (tempfile::TempDir, Arc<Loom>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LoomConfig::default();
    config.data_dir = dir.path().to_string_lossy().to_string();
    config.transport.http.port = 0;
    config.transport.websocket.port = 0;
    config.transport.stdio.enabled = false;
    let llm = Arc::new(ScriptedCompletionClient::new(replies));
    let loom = Loom::with_llm(config, llm).await.unwrap();
    (dir, loom)
}

async fn seed_task(loom: &Loom, title: &str, task_type: TaskType) -> AtomicTask {
    let project = loom
        .storage
        .create_project(
            Project::new("demo", "/srv/demo")
                .with_tech_stack(vec!["typescript".to_string(), "express".to_string()]),
        )
        .await
        .unwrap();
    let epic = loom
        .storage
        .create_epic(Epic::new(&project.id, "core"))
        .await
        .unwrap();
    loom.storage
        .create_task(
            AtomicTask::new(&project.id, &epic.id, title, task_type)
                .with_estimated_hours(1.0)
                .with_file_paths(vec!["src/feature.ts".to_string()])
                .with_acceptance_criteria(vec!["behavior verified by an integration test".to_string()]),
        )
        .await
        .unwrap()
}

/// Register an in-process agent reachable over its session push channel.
fn seed_sse_agent(loom: &Loom, agent_id: &str, max_concurrent: usize) -> Receiver<Frame> {
    let session_id = format!("sess-{agent_id}");
    let rx = loom.bus.register(&session_id);
    let mut agent = AgentRecord::new(
        agent_id,
        vec!["development".to_string()],
        TransportKind::Sse,
    );
    agent.session_id = Some(session_id);
    agent.config.max_concurrent_tasks = max_concurrent;
    loom.registry.register(agent, false).unwrap();
    rx
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_task_status(loom: &Loom, task_id: &str, status: TaskStatus) {
    for _ in 0..200 {
        if let Ok(Some(task)) = loom.storage.try_get_task(task_id).await {
            if task.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for task {task_id} to reach {status:?}");
}

async fn next_event(rx: &mut Receiver<Frame>, event: &str) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no {event} frame within 2s"))
            .expect("channel closed");
        if frame.event == event {
            return serde_json::from_str(&frame.data).unwrap_or(serde_json::Value::Null);
        }
    }
}

#[tokio::test]
async fn atomic_task_happy_path() {
    let (_dir, loom) = world_with(vec![]).await;
    let mut agent_rx = seed_sse_agent(&loom, "a1", 2);
    let task = seed_task(&loom, "Implement feature flag read path", TaskType::Development).await;
    assert_eq!(task.status, TaskStatus::Pending);

    let orchestrator = loom.orchestrator.clone();
    let task_id = task.id.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .execute_task(
                &task_id,
                ExecuteOptions {
                    timeout_secs: Some(10),
                    force: false,
                },
            )
            .await
    });

    // Assignment lands: task in progress, execution awaited.
    wait_for_task_status(&loom, &task.id, TaskStatus::InProgress).await;
    wait_until("execution to be tracked", || loom.tracker.pending_count() == 1).await;

    // The agent saw its task arrive on the push channel.
    let delivered = next_event(&mut agent_rx, "taskDelivered").await;
    assert_eq!(delivered["task_id"], task.id);

    // Agent completes.
    loom.processor
        .process(AgentTaskResponse {
            agent_id: "a1".to_string(),
            task_id: task.id.clone(),
            status: ResponseStatus::Done,
            response: "feature implemented".to_string(),
            completion_details: Some(CompletionDetails {
                files_modified: vec!["src/feature.ts".to_string()],
                tests_passed: Some(true),
                build_passed: Some(true),
                duration_ms: Some(1_200),
            }),
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.result.as_ref().unwrap()["success"], true);
    assert!(outcome.assignment.is_some());

    // pending -> in_progress -> completed ended in storage.
    let task_after = loom.storage.get_task(&task.id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Completed);

    // The job keyed by the task id holds the result.
    let job = loom.jobs.get(&task.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref().unwrap()["success"], true);

    // The push channel carried the completion with the sentinel keyword.
    let completed = next_event(&mut agent_rx, "taskCompleted").await;
    assert_eq!(completed["taskId"], task.id);
    assert_eq!(completed["status"], "DONE");
    assert_eq!(completed["filesModified"][0], "src/feature.ts");

    // The agent is free again.
    let agent = loom.registry.get("a1").unwrap();
    assert!(agent.current_tasks.is_empty());
    assert_eq!(agent.performance.tasks_completed, 1);
}

#[tokio::test]
async fn rate_limited_polling_over_the_tool_surface() {
    let (_dir, loom) = world_with(vec![]).await;
    let state = loom.transport_state();

    let job_id = loom
        .jobs
        .create("long-analysis", serde_json::json!({"scope": "repo"}));
    loom.jobs
        .set_progress(&job_id, JobStatus::Running, "analysing")
        .unwrap();

    let first = handle_tool_call(
        &state,
        ToolCall {
            id: None,
            tool: "get-job-result".to_string(),
            params: serde_json::json!({"jobId": job_id}),
        },
    )
    .await;
    assert!(!first.is_error);
    assert!(first.content[0].text.contains("Running"));
    assert_eq!(first.poll_interval, Some(1));

    // Second poll within 100 ms is deferred without data.
    let second = handle_tool_call(
        &state,
        ToolCall {
            id: None,
            tool: "get-job-result".to_string(),
            params: serde_json::json!({"jobId": job_id}),
        },
    )
    .await;
    assert!(!second.is_error);
    assert!(second.content[0].text.contains("Please wait"));
    assert_eq!(second.poll_interval, Some(1));

    // The denied poll did not advance the access stamp.
    let outcome = loom.jobs.get(&job_id).unwrap();
    let raw = loom.jobs.get_with_rate_limit(&job_id).unwrap();
    assert!(raw.should_wait);
    assert!(raw.wait_ms > 0 && raw.wait_ms <= 1000, "{}", raw.wait_ms);
    assert_eq!(
        loom.jobs.get(&job_id).unwrap().last_accessed_at,
        outcome.last_accessed_at
    );
}

#[tokio::test]
async fn decomposition_materialises_a_dependency_dag() {
    let reply = serde_json::json!([
        {
            "title": "Create user model",
            "description": "Persist users with hashed passwords",
            "taskType": "development",
            "estimatedHours": 2.0,
            "filePaths": ["src/models/user.ts"],
            "acceptanceCriteria": ["User model stores email and password hash"]
        },
        {
            "title": "Create registration route",
            "description": "POST /register endpoint validating input",
            "taskType": "development",
            "estimatedHours": 2.0,
            "filePaths": ["src/routes/register.ts"],
            "acceptanceCriteria": ["Registration endpoint returns 201 on success"]
        },
        {
            "title": "Test registration route",
            "description": "Integration tests for the registration endpoint",
            "taskType": "testing",
            "estimatedHours": 1.5,
            "filePaths": ["test/routes/register.test.ts"],
            "acceptanceCriteria": ["Registration tests cover success and validation failure"]
        }
    ])
    .to_string();
    let (_dir, loom) = world_with(vec![Ok(reply)]).await;

    // Coarse enough that decomposition triggers.
    let parent = {
        let mut t = seed_task(&loom, "Implement user registration", TaskType::Development).await;
        t.estimated_hours = 12.0;
        t.acceptance_criteria.clear();
        loom.storage.update_task(t).await.unwrap()
    };

    let ctx = crate::models::ProjectContext {
        languages: vec!["typescript".to_string()],
        frameworks: vec!["express".to_string()],
        ..Default::default()
    };
    let report = loom.decomposition.decompose(&parent.id, &ctx).await.unwrap();

    assert!(!report.atomic);
    assert!((3..=6).contains(&report.children.len()));
    assert!(report.applied_dependencies >= 1);

    let find = |needle: &str| {
        report
            .children
            .iter()
            .find(|c| c.title.to_lowercase().contains(needle))
            .unwrap_or_else(|| panic!("no child matching {needle}"))
            .clone()
    };
    let model = find("model");
    let route = find("route");
    let test = find("test registration");

    assert_eq!(model.task_type, TaskType::Development);
    assert!(model.file_paths.iter().any(|p| p.contains("model")));
    assert_eq!(test.task_type, TaskType::Testing);

    // Mirrors reflect the applied edges.
    let route = loom.storage.get_task(&route.id).await.unwrap();
    assert!(route.depends_on.contains(&model.id));
    let test = loom.storage.get_task(&test.id).await.unwrap();
    assert!(test.depends_on.contains(&route.id));

    // The persisted plan is acyclic and runnable in order.
    let graph = loom.storage.get_graph(&parent.project_id).await.unwrap().unwrap();
    let pos = |id: &str| graph.topological_order.iter().position(|t| t == id).unwrap();
    assert!(pos(&model.id) < pos(&route.id));
    assert!(pos(&route.id) < pos(&test.id));
}

#[tokio::test]
async fn offline_agent_is_reclaimed_mid_execution() {
    let (_dir, loom) = world_with(vec![]).await;
    let mut observer = loom.bus.register("observer");
    let _agent_rx = seed_sse_agent(&loom, "a2", 1);
    let task = seed_task(&loom, "Long running refactor step", TaskType::Development).await;

    let orchestrator = loom.orchestrator.clone();
    let task_id = task.id.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .execute_task(
                &task_id,
                ExecuteOptions {
                    timeout_secs: Some(30),
                    force: false,
                },
            )
            .await
    });
    wait_until("execution to be tracked", || loom.tracker.pending_count() == 1).await;

    // The agent stops heartbeating.
    loom.registry
        .update("a2", |a| {
            a.last_heartbeat = Utc::now() - ChronoDuration::seconds(600);
        })
        .unwrap();

    let sweeper = HeartbeatSweeper::new(
        loom.registry.clone(),
        loom.queues.clone(),
        loom.bus.clone(),
        loom.tracker.clone(),
        60,
    );
    let offlined = sweeper.sweep_once();
    assert_eq!(offlined, vec!["a2".to_string()]);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.error.as_deref(), Some("agent_lost"));

    // Agent offline, task reclaimed to the unassigned pool, one notification.
    assert_eq!(
        loom.registry.get("a2").unwrap().state,
        crate::models::AgentState::Offline
    );
    assert_eq!(loom.queues.unassigned_len(), 1);
    let task_after = loom.storage.get_task(&task.id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Pending);
    assert!(task_after.assigned_agent.is_none());

    let payload = next_event(&mut observer, "agent_offline").await;
    assert_eq!(payload["agentId"], "a2");
}

#[tokio::test]
async fn delivery_failure_surfaces_exactly_one_error() {
    let (_dir, loom) = world_with(vec![]).await;

    // HTTP agent with nothing listening at its endpoint.
    let mut agent = AgentRecord::new("dead", vec!["development".to_string()], TransportKind::Http);
    agent.http_endpoint = Some("http://127.0.0.1:1/tasks".to_string());
    loom.registry.register(agent, false).unwrap();

    let task = seed_task(&loom, "Deliverable unit", TaskType::Development).await;
    // A short execution timeout bounds the delivery retry window too.
    let outcome = loom
        .orchestrator
        .execute_task(
            &task.id,
            ExecuteOptions {
                timeout_secs: Some(1),
                force: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.error.as_deref(), Some("Task delivery failed"));

    let job = loom.jobs.get(&task.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result.as_ref().unwrap()["error"], "Task delivery failed");
}

#[tokio::test]
async fn cancellation_releases_everything() {
    let (_dir, loom) = world_with(vec![]).await;
    let mut watcher = loom.bus.register("watcher");
    let _agent_rx = seed_sse_agent(&loom, "a3", 1);
    let task = seed_task(&loom, "Cancellable unit", TaskType::Development).await;

    let orchestrator = loom.orchestrator.clone();
    let task_id = task.id.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .execute_task(
                &task_id,
                ExecuteOptions {
                    timeout_secs: Some(30),
                    force: false,
                },
            )
            .await
    });

    let assignment = next_event(&mut watcher, "assignment").await;
    let execution_id = assignment["executionId"].as_str().unwrap().to_string();
    wait_until("execution to be tracked", || loom.tracker.pending_count() == 1).await;

    loom.orchestrator.cancel_execution(&execution_id).unwrap();
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(outcome.metadata.execution_id, execution_id);

    // Resources are released: task reschedulable, agent free, queue empty.
    let task_after = loom.storage.get_task(&task.id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Pending);
    assert!(task_after.assigned_agent.is_none());
    assert!(loom.registry.get("a3").unwrap().current_tasks.is_empty());
    assert_eq!(loom.queues.len("a3"), 0);

    // A second cancel of the finished execution is a not-found error.
    assert!(loom.orchestrator.cancel_execution(&execution_id).is_err());
}

#[tokio::test]
async fn path_traversal_is_rejected_and_audited() {
    let (_dir, loom) = world_with(vec![]).await;
    let state = loom.transport_state();

    let result = handle_tool_call(
        &state,
        ToolCall {
            id: None,
            tool: "validate-path".to_string(),
            params: serde_json::json!({"path": "../../etc/passwd", "sessionId": "sess-x"}),
        },
    )
    .await;

    assert!(result.is_error);
    assert_eq!(result.error_details.unwrap().code, "security_violation");
    let text = &result.content[0].text;
    assert!(text.contains("traversal"));
    // No fragment of the probed path leaks into the reply.
    assert!(!text.contains("etc"));
    assert!(!text.contains("passwd"));

    let recent = loom.security.audit.recent(10);
    assert!(recent
        .iter()
        .any(|r| r.kind == crate::security::AuditKind::SecurityViolation));
}

#[tokio::test]
async fn no_agent_means_queued_outcome() {
    let (_dir, loom) = world_with(vec![]).await;
    let task = seed_task(&loom, "Orphan unit", TaskType::Development).await;

    let outcome = loom
        .orchestrator
        .execute_task(&task.id, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Queued);
    assert!(outcome.queued);
    assert_eq!(loom.queues.unassigned_len(), 1);
}
