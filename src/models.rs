use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// A project groups epics and tasks under one root directory.
///
/// Projects are created on the first request naming them and live until
/// explicit deletion, which cascades to everything they own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_dir: String,
    pub config: ProjectConfig,
    pub epic_ids: Vec<String>,
    pub tech_stack: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub max_concurrent_tasks: usize,
    pub performance_target_ms: u64,
    pub research_enabled: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            performance_target_ms: 500,
            research_enabled: true,
        }
    }
}

impl Project {
    pub fn new(name: impl Into<String>, root_dir: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            root_dir: root_dir.into(),
            config: ProjectConfig::default(),
            epic_ids: Vec::new(),
            tech_stack: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tech_stack(mut self, stack: Vec<String>) -> Self {
        self.tech_stack = stack;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Open,
    InProgress,
    Completed,
}

/// A functional grouping of tasks inside a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epic {
    pub id: String,
    pub project_id: String,
    pub functional_area: String,
    pub status: EpicStatus,
    pub priority: Priority,
    pub task_ids: Vec<String>,
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Epic {
    pub fn new(project_id: impl Into<String>, functional_area: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            functional_area: functional_area.into(),
            status: EpicStatus::Open,
            priority: Priority::Medium,
            task_ids: Vec::new(),
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task categories, fixed across the system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Development,
    Testing,
    Research,
    Docs,
    Deployment,
}

impl TaskType {
    /// Skill token an agent must carry to pick up tasks of this type.
    pub fn required_skill(&self) -> &'static str {
        match self {
            TaskType::Development => "development",
            TaskType::Testing => "testing",
            TaskType::Research => "research",
            TaskType::Docs => "docs",
            TaskType::Deployment => "deployment",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "development" => Ok(TaskType::Development),
            "testing" => Ok(TaskType::Testing),
            "research" => Ok(TaskType::Research),
            "docs" => Ok(TaskType::Docs),
            "deployment" => Ok(TaskType::Deployment),
            _ => Err(format!("unknown task type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The fundamental unit of work: small enough for a single agent to execute.
///
/// Tasks are nodes in a project's dependency graph; `depends_on` and
/// `dependents` are maintained as mirror images by the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtomicTask {
    pub id: String,
    pub project_id: String,
    pub epic_id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub estimated_hours: f64,
    pub depends_on: Vec<String>,
    pub dependents: Vec<String>,
    pub file_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub tags: Vec<String>,
    pub assigned_agent: Option<String>,
    pub agent_response: Option<AgentTaskResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AtomicTask {
    pub fn new(
        project_id: impl Into<String>,
        epic_id: impl Into<String>,
        title: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            epic_id: epic_id.into(),
            title: title.into(),
            description: String::new(),
            task_type,
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            estimated_hours: 1.0,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            file_paths: Vec::new(),
            acceptance_criteria: Vec::new(),
            tags: Vec::new(),
            assigned_agent: None,
            agent_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_hours(mut self, hours: f64) -> Self {
        self.estimated_hours = hours;
        self
    }

    pub fn with_file_paths(mut self, paths: Vec<String>) -> Self {
        self.file_paths = paths;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    /// Skills this task demands of an agent.
    pub fn required_skills(&self) -> Vec<String> {
        let mut skills = vec![self.task_type.required_skill().to_string()];
        for tag in &self.tags {
            if let Some(skill) = tag.strip_prefix("skill:") {
                skills.push(skill.to_string());
            }
        }
        skills
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    TaskOrder,
    Data,
    Resource,
    Knowledge,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStrength {
    Required,
    Optional,
}

/// A directed edge between two tasks of the same project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    pub id: String,
    pub project_id: String,
    pub from_task: String,
    pub to_task: String,
    pub kind: DependencyKind,
    pub strength: DependencyStrength,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dependency {
    pub fn new(
        project_id: impl Into<String>,
        from_task: impl Into<String>,
        to_task: impl Into<String>,
        kind: DependencyKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            from_task: from_task.into(),
            to_task: to_task.into(),
            kind,
            strength: DependencyStrength::Required,
            rationale: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Materialized per-project view of the dependency edges.
///
/// Holds the topological order and the parallel execution batches; always
/// acyclic by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyGraph {
    pub id: String,
    pub project_id: String,
    pub edges: Vec<(String, String)>,
    pub topological_order: Vec<String>,
    pub batches: Vec<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DependencyGraph {
    pub fn empty(project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let now = Utc::now();
        Self {
            id: format!("graph-{project_id}"),
            project_id,
            edges: Vec::new(),
            topological_order: Vec::new(),
            batches: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    Websocket,
    Sse,
}

/// Rolling execution statistics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPerformance {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_completion_ms: f64,
    pub success_rate: f64,
    pub last_active_at: DateTime<Utc>,
}

impl AgentPerformance {
    pub fn new() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            avg_completion_ms: 0.0,
            success_rate: 1.0,
            last_active_at: Utc::now(),
        }
    }

    /// Fold one finished execution into the rolling averages.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let total = self.tasks_completed + self.tasks_failed;
        self.avg_completion_ms =
            (self.avg_completion_ms * total as f64 + duration_ms as f64) / (total + 1) as f64;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = self.tasks_completed + self.tasks_failed;
        self.success_rate = self.tasks_completed as f64 / total as f64;
        self.last_active_at = Utc::now();
    }

    pub fn sample_count(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub max_concurrent_tasks: usize,
    pub preferred_types: Vec<TaskType>,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            preferred_types: Vec::new(),
            timeout_secs: 1800,
        }
    }
}

/// A registered worker agent.
///
/// Canonical record stored by id; tasks reference agents (and vice versa)
/// only through ids so neither side outlives the other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub current_tasks: Vec<String>,
    pub performance: AgentPerformance,
    pub config: AgentConfig,
    pub transport: TransportKind,
    pub session_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub http_endpoint: Option<String>,
    pub http_auth_token: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, transport: TransportKind) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            capabilities,
            state: AgentState::Idle,
            current_tasks: Vec::new(),
            performance: AgentPerformance::new(),
            config: AgentConfig::default(),
            transport,
            session_id: None,
            last_heartbeat: now,
            http_endpoint: None,
            http_auth_token: None,
            registered_at: now,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, AgentState::Idle | AgentState::Busy)
            && self.current_tasks.len() < self.config.max_concurrent_tasks
    }

    pub fn current_load(&self) -> f64 {
        if self.config.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.current_tasks.len() as f64 / self.config.max_concurrent_tasks as f64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Queued,
    Delivered,
    Executing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl AssignmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssignmentState::Completed
                | AssignmentState::Failed
                | AssignmentState::Cancelled
                | AssignmentState::TimedOut
        )
    }
}

/// One attempt to run a task on a specific agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub accepted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: AssignmentState,
}

impl Assignment {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            accepted_at: Utc::now(),
            deadline,
            state: AssignmentState::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Client-visible handle on a long-running invocation.
///
/// For task executions the job id equals the task id; other callers mint
/// their own ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            params,
            status: JobStatus::Pending,
            progress_message: None,
            result: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }
}

/// Status keyword in an agent's completion message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseStatus {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "PARTIAL")]
    Partial,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseStatus::Done | ResponseStatus::Error)
    }

    pub fn as_task_status(&self) -> TaskStatus {
        match self {
            ResponseStatus::Done => TaskStatus::Completed,
            ResponseStatus::Error => TaskStatus::Failed,
            ResponseStatus::Partial => TaskStatus::InProgress,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResponseStatus::Done => "DONE",
            ResponseStatus::Error => "ERROR",
            ResponseStatus::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompletionDetails {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub build_passed: Option<bool>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// What an agent sends back when it finishes (or abandons) a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTaskResponse {
    pub agent_id: String,
    pub task_id: String,
    pub status: ResponseStatus,
    pub response: String,
    pub completion_details: Option<CompletionDetails>,
    pub received_at: DateTime<Utc>,
}

/// What travels to an agent when a task is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub title: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskDescriptor {
    pub fn from_task(task: &AtomicTask, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            payload: serde_json::json!({
                "description": task.description,
                "taskType": task.task_type,
                "filePaths": task.file_paths,
                "acceptanceCriteria": task.acceptance_criteria,
            }),
            priority: task.priority,
            deadline,
            enqueued_at: Utc::now(),
        }
    }
}

/// Context handed to the decomposition engine alongside a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectContext {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub existing_task_titles: Vec<String>,
    pub codebase_summary: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults_are_pending() {
        let task = AtomicTask::new("p1", "e1", "Add login route", TaskType::Development);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn performance_record_updates_averages() {
        let mut perf = AgentPerformance::new();
        perf.record(true, 1000);
        perf.record(false, 3000);
        assert_eq!(perf.tasks_completed, 1);
        assert_eq!(perf.tasks_failed, 1);
        assert!((perf.avg_completion_ms - 2000.0).abs() < f64::EPSILON);
        assert!((perf.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn response_status_maps_to_task_status() {
        assert_eq!(ResponseStatus::Done.as_task_status(), TaskStatus::Completed);
        assert_eq!(ResponseStatus::Error.as_task_status(), TaskStatus::Failed);
        assert_eq!(
            ResponseStatus::Partial.as_task_status(),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn response_status_serializes_uppercase() {
        let json = serde_json::to_string(&ResponseStatus::Done).unwrap();
        assert_eq!(json, "\"DONE\"");
    }

    #[test]
    fn agent_availability_respects_ceiling() {
        let mut agent = AgentRecord::new("a1", vec!["development".into()], TransportKind::Http);
        agent.config.max_concurrent_tasks = 1;
        assert!(agent.is_available());
        agent.current_tasks.push("t1".into());
        assert!(!agent.is_available());
        assert!((agent.current_load() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn priority_ordering_matches_severity() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
