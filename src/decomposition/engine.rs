use super::atomicity::{self, AtomicityAnalysis};
use super::dependency_inference::{self, DependencySuggestion};
use super::plan::{self, ExecutionPlan};
use super::research::{self, ResearchDecision};
use crate::config::DecompositionConfig;
use crate::constants::{MAX_DECOMPOSED_TASKS, MIN_DECOMPOSED_TASKS};
use crate::llm::CompletionClient;
use crate::models::{
    AtomicTask, Dependency, DependencyGraph, ProjectContext, TaskStatus, TaskType,
};
use crate::storage::StorageEngine;
use crate::{LoomError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STRICT_RETRY_SUFFIX: &str = "\nReturn ONLY a JSON array of child task objects with fields \
title, description, taskType, estimatedHours, filePaths, acceptanceCriteria. \
Between 2 and 10 entries. No prose.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildDraft {
    title: String,
    #[serde(default)]
    description: String,
    task_type: String,
    #[serde(default = "default_hours")]
    estimated_hours: f64,
    #[serde(default)]
    file_paths: Vec<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

fn default_hours() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionReport {
    pub task_id: String,
    pub atomic: bool,
    pub atomicity: AtomicityAnalysis,
    pub research: Option<ResearchDecision>,
    pub children: Vec<AtomicTask>,
    pub applied_dependencies: usize,
    pub suggested_dependencies: Vec<DependencySuggestion>,
    pub plan: Option<ExecutionPlan>,
}

/// Turns a coarse task into a DAG of atomic children.
pub struct DecompositionEngine {
    config: DecompositionConfig,
    storage: StorageEngine,
    llm: Arc<dyn CompletionClient>,
}

impl DecompositionEngine {
    pub fn new(
        config: DecompositionConfig,
        storage: StorageEngine,
        llm: Arc<dyn CompletionClient>,
    ) -> Self {
        Self {
            config,
            storage,
            llm,
        }
    }

    /// Decompose one task in its project context.
    ///
    /// An already-atomic task comes back unchanged, with no children and no
    /// writes. Otherwise the children are materialized under the same epic,
    /// inferred dependencies at or above the confidence threshold are
    /// applied, and the project plan is recomputed.
    pub async fn decompose(&self, task_id: &str, ctx: &ProjectContext) -> Result<DecompositionReport> {
        let mut task = self.storage.get_task(task_id).await?;

        let analysis = atomicity::analyze(&task, ctx, self.config.atomic_hour_ceiling);
        if analysis.is_atomic {
            debug!(task_id, "task is already atomic");
            return Ok(DecompositionReport {
                task_id: task_id.to_string(),
                atomic: true,
                atomicity: analysis,
                research: None,
                children: Vec::new(),
                applied_dependencies: 0,
                suggested_dependencies: Vec::new(),
                plan: None,
            });
        }

        // Research pass, when triggered, feeds the next iteration's prompt.
        let research = research::evaluate(&task, ctx, self.config.atomic_hour_ceiling);
        let research = if research.should_research {
            match self.attach_research(&mut task, ctx, &research).await {
                Ok(()) => Some(research),
                Err(e) => {
                    warn!(task_id, "research pass failed, continuing: {e}");
                    Some(research)
                }
            }
        } else {
            None
        };

        let drafts = self.request_children(&task, ctx).await?;

        let mut children = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let task_type = TaskType::from_str(&draft.task_type)
                .unwrap_or(TaskType::Development);
            let child = AtomicTask::new(&task.project_id, &task.epic_id, draft.title, task_type)
                .with_description(draft.description)
                .with_priority(task.priority)
                .with_estimated_hours(draft.estimated_hours)
                .with_file_paths(draft.file_paths)
                .with_acceptance_criteria(draft.acceptance_criteria);
            let mut child = child;
            child.tags.push(format!("parent:{}", task.id));
            children.push(self.storage.create_task(child).await?);
        }

        // Dependency inference over the fresh children.
        let suggestions = dependency_inference::infer(&children);
        let (to_apply, mut suggested) =
            dependency_inference::partition(suggestions, self.config.auto_apply_threshold);

        let mut applied = 0;
        for suggestion in to_apply {
            let mut dep = Dependency::new(
                &task.project_id,
                &suggestion.from,
                &suggestion.to,
                suggestion.kind,
            );
            dep.rationale = Some(suggestion.reason.clone());
            match self.storage.create_dependency(dep).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    // A cycle-refused edge is demoted to a report entry.
                    debug!("suggested edge not applied: {e}");
                    suggested.push(suggestion);
                }
            }
        }

        // The parent becomes a container: blocked until its children finish.
        task.status = TaskStatus::Blocked;
        if !task.tags.iter().any(|t| t == "decomposed") {
            task.tags.push("decomposed".to_string());
        }
        self.storage.update_task(task.clone()).await?;

        let graph = self.refresh_plan(&task.project_id).await?;
        info!(
            task_id,
            children = children.len(),
            applied,
            "task decomposed"
        );

        Ok(DecompositionReport {
            task_id: task_id.to_string(),
            atomic: false,
            atomicity: analysis,
            research,
            children,
            applied_dependencies: applied,
            suggested_dependencies: suggested,
            plan: Some(ExecutionPlan {
                topological_order: graph.topological_order,
                batches: graph.batches,
            }),
        })
    }

    /// Recompute and persist the project's graph entity.
    pub async fn refresh_plan(&self, project_id: &str) -> Result<DependencyGraph> {
        let tasks = self.storage.list_tasks_by_project(project_id).await?;
        let deps = self.storage.list_dependencies_by_project(project_id).await?;
        let graph = plan::compute_graph(project_id, &tasks, &deps)?;
        self.storage.save_graph(graph.clone()).await?;
        Ok(graph)
    }

    /// Run inference over a project's current tasks and apply confident
    /// edges; returns (applied, reported).
    pub async fn detect_and_apply_dependencies(
        &self,
        project_id: &str,
    ) -> Result<(usize, Vec<DependencySuggestion>)> {
        let tasks = self.storage.list_tasks_by_project(project_id).await?;
        let existing: HashSet<(String, String)> = self
            .storage
            .list_dependencies_by_project(project_id)
            .await?
            .into_iter()
            .map(|d| (d.from_task, d.to_task))
            .collect();

        let suggestions = dependency_inference::infer(&tasks)
            .into_iter()
            .filter(|s| !existing.contains(&(s.from.clone(), s.to.clone())))
            .collect();
        let (to_apply, mut suggested) =
            dependency_inference::partition(suggestions, self.config.auto_apply_threshold);

        let mut applied = 0;
        for suggestion in to_apply {
            let mut dep =
                Dependency::new(project_id, &suggestion.from, &suggestion.to, suggestion.kind);
            dep.rationale = Some(suggestion.reason.clone());
            match self.storage.create_dependency(dep).await {
                Ok(_) => applied += 1,
                Err(_) => suggested.push(suggestion),
            }
        }
        if applied > 0 {
            self.refresh_plan(project_id).await?;
        }
        Ok((applied, suggested))
    }

    async fn attach_research(
        &self,
        task: &mut AtomicTask,
        ctx: &ProjectContext,
        decision: &ResearchDecision,
    ) -> Result<()> {
        let prompt = format!(
            "Research briefing for an engineering task.\nTask: {}\nReason: {}\nStack: {}\n\
             Summarize what the implementer must know first.",
            task.title,
            decision.reason,
            ctx.languages
                .iter()
                .chain(ctx.frameworks.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        );
        let findings = self.llm.complete(&prompt).await?;

        task.description = format!("{}\n\nResearch notes: {}", task.description, findings.trim());
        if !task.tags.iter().any(|t| t == "research:attached") {
            task.tags.push("research:attached".to_string());
        }
        *task = self.storage.update_task(task.clone()).await?;
        Ok(())
    }

    /// One LLM round, with a single stricter retry on malformed output.
    async fn request_children(
        &self,
        task: &AtomicTask,
        ctx: &ProjectContext,
    ) -> Result<Vec<ChildDraft>> {
        let base_prompt = format!(
            "Decompose this task into between {MIN_DECOMPOSED_TASKS} and {MAX_DECOMPOSED_TASKS} \
             atomic child tasks.\nTitle: {}\nDescription: {}\nLanguages: {}\nFrameworks: {}\n\
             Existing tasks: {}",
            task.title,
            task.description,
            ctx.languages.join(", "),
            ctx.frameworks.join(", "),
            ctx.existing_task_titles.join("; "),
        );

        let mut last_problem = String::new();
        for (attempt, prompt) in [
            base_prompt.clone(),
            format!("{base_prompt}{STRICT_RETRY_SUFFIX}"),
        ]
        .into_iter()
        .enumerate()
        {
            match self.llm.complete(&prompt).await {
                Ok(text) => match parse_drafts(&text) {
                    Ok(drafts) => return Ok(drafts),
                    Err(problem) => {
                        warn!(task_id = %task.id, attempt, "malformed decomposition: {problem}");
                        last_problem = problem;
                    }
                },
                Err(e) => {
                    warn!(task_id = %task.id, attempt, "decomposition call failed: {e}");
                    last_problem = e.to_string();
                }
            }
        }

        Err(LoomError::Validation(format!(
            "decomposition output unusable after retry: {last_problem}"
        )))
    }
}

fn parse_drafts(text: &str) -> std::result::Result<Vec<ChildDraft>, String> {
    let start = text.find('[').ok_or("no JSON array found")?;
    let end = text.rfind(']').ok_or("unterminated JSON array")?;
    let drafts: Vec<ChildDraft> =
        serde_json::from_str(&text[start..=end]).map_err(|e| e.to_string())?;

    if drafts.len() < MIN_DECOMPOSED_TASKS || drafts.len() > MAX_DECOMPOSED_TASKS {
        return Err(format!("{} children outside allowed range", drafts.len()));
    }
    let mut titles = HashSet::new();
    for draft in &drafts {
        if draft.title.trim().is_empty() {
            return Err("child with empty title".to_string());
        }
        if !titles.insert(draft.title.to_lowercase()) {
            return Err(format!("duplicate child title '{}'", draft.title));
        }
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoomConfig;
    use crate::llm::ScriptedCompletionClient;
    use crate::models::{Epic, Project};
    use crate::security::locks::LockManager;
    use std::time::Duration;

    async fn engine_with(replies: Vec<Result<String>>) -> (tempfile::TempDir, DecompositionEngine, StorageEngine, AtomicTask) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoomConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let storage = StorageEngine::open(&config, LockManager::new(Duration::from_secs(5)))
            .await
            .unwrap();

        let project = storage
            .create_project(Project::new("demo", "/srv/demo").with_tech_stack(vec![
                "typescript".to_string(),
                "express".to_string(),
            ]))
            .await
            .unwrap();
        let epic = storage.create_epic(Epic::new(&project.id, "auth")).await.unwrap();

        // Coarse enough to decompose: no criteria, heavy estimate.
        let task = storage
            .create_task(
                AtomicTask::new(&project.id, &epic.id, "Implement user registration", TaskType::Development)
                    .with_estimated_hours(12.0),
            )
            .await
            .unwrap();

        let llm = Arc::new(ScriptedCompletionClient::new(replies));
        let engine = DecompositionEngine::new(DecompositionConfig::default(), storage.clone(), llm);
        (dir, engine, storage, task)
    }

    fn ctx() -> ProjectContext {
        ProjectContext {
            languages: vec!["typescript".to_string()],
            frameworks: vec!["express".to_string()],
            ..Default::default()
        }
    }

    fn registration_reply() -> String {
        serde_json::json!([
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
        .to_string()
    }

    #[tokio::test]
    async fn atomic_task_returned_unchanged() {
        let (_dir, engine, storage, _) = engine_with(vec![]).await;

        // Build a tight atomic task directly.
        let projects = storage.list_projects().await.unwrap();
        let epics = storage.list_epics_by_project(&projects[0].id).await.unwrap();
        let atomic = storage
            .create_task(
                AtomicTask::new(&projects[0].id, &epics[0].id, "Rename field", TaskType::Development)
                    .with_estimated_hours(0.5)
                    .with_file_paths(vec!["src/models/user.ts".to_string()])
                    .with_acceptance_criteria(vec!["Field renamed everywhere it is read".to_string()]),
            )
            .await
            .unwrap();
        let before = storage.get_task(&atomic.id).await.unwrap();

        let report = engine.decompose(&atomic.id, &ctx()).await.unwrap();
        assert!(report.atomic);
        assert!(report.children.is_empty());
        assert_eq!(storage.get_task(&atomic.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn decomposition_builds_children_and_dependencies() {
        let (_dir, engine, storage, task) =
            engine_with(vec![Ok(registration_reply())]).await;

        let report = engine.decompose(&task.id, &ctx()).await.unwrap();
        assert!(!report.atomic);
        assert_eq!(report.children.len(), 3);
        assert!(report.applied_dependencies >= 1);

        // Model -> route -> test ordering shows up in the plan.
        let plan = report.plan.unwrap();
        let pos = |needle: &str| {
            let id = report
                .children
                .iter()
                .find(|c| c.title.to_lowercase().contains(needle))
                .map(|c| c.id.clone())
                .unwrap();
            plan.topological_order.iter().position(|t| *t == id).unwrap()
        };
        assert!(pos("model") < pos("route"));
        assert!(pos("route") < pos("test"));

        // Parent is now a blocked container.
        let parent = storage.get_task(&task.id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Blocked);
        assert!(parent.tags.iter().any(|t| t == "decomposed"));

        // Graph entity persisted without cycles.
        let graph = storage.get_graph(&task.project_id).await.unwrap().unwrap();
        assert_eq!(graph.topological_order.len(), 4); // parent + 3 children
    }

    #[tokio::test]
    async fn malformed_reply_retries_once_with_stricter_prompt() {
        let (_dir, engine, _storage, task) = engine_with(vec![
            Ok("sure, here are some ideas!".to_string()),
            Ok(registration_reply()),
        ])
        .await;

        let report = engine.decompose(&task.id, &ctx()).await.unwrap();
        assert_eq!(report.children.len(), 3);
    }

    #[tokio::test]
    async fn twice_malformed_reply_is_an_error() {
        let (_dir, engine, _storage, task) = engine_with(vec![
            Ok("not json".to_string()),
            Ok("[{\"title\": \"only one\", \"taskType\": \"development\"}]".to_string()),
        ])
        .await;

        let err = engine.decompose(&task.id, &ctx()).await.unwrap_err();
        assert!(matches!(err, LoomError::Validation(_)));
    }

    #[test]
    fn parse_drafts_rejects_scalars_and_duplicates() {
        assert!(parse_drafts("0.7").is_err());
        let dup = serde_json::json!([
            {"title": "Same", "taskType": "development"},
            {"title": "same", "taskType": "development"}
        ])
        .to_string();
        assert!(parse_drafts(&dup).is_err());
    }
}
