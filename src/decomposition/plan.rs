use crate::models::{AtomicTask, Dependency, DependencyGraph};
use crate::{LoomError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Topological order plus the parallel batches derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub topological_order: Vec<String>,
    pub batches: Vec<Vec<String>>,
}

/// Kahn's algorithm over `edges` (`from` runs before `to`).
///
/// Batch k is the set of tasks whose remaining in-degree is zero at step k;
/// every batch can run in parallel. A cycle is a validation error naming the
/// tasks trapped in it.
pub fn build_plan(task_ids: &[String], edges: &[(String, String)]) -> Result<ExecutionPlan> {
    let known: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
    let mut in_degree: HashMap<&str, usize> = task_ids.iter().map(|t| (t.as_str(), 0)).collect();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

    for (from, to) in edges {
        if !known.contains(from.as_str()) || !known.contains(to.as_str()) {
            return Err(LoomError::Validation(format!(
                "dependency references unknown task ({from} -> {to})"
            )));
        }
        *in_degree.get_mut(to.as_str()).expect("known task") += 1;
        downstream.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut order: Vec<String> = Vec::with_capacity(task_ids.len());
    let mut batches: Vec<Vec<String>> = Vec::new();

    let mut ready: Vec<&str> = task_ids
        .iter()
        .map(String::as_str)
        .filter(|t| in_degree[*t] == 0)
        .collect();

    while !ready.is_empty() {
        ready.sort();
        let batch: Vec<String> = ready.iter().map(|t| t.to_string()).collect();

        let mut next: Vec<&str> = Vec::new();
        for task in ready {
            order.push(task.to_string());
            if let Some(children) = downstream.get(task) {
                for child in children {
                    let degree = in_degree.get_mut(child).expect("known task");
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(child);
                    }
                }
            }
        }
        batches.push(batch);
        ready = next;
    }

    if order.len() != task_ids.len() {
        let stuck: Vec<&str> = task_ids
            .iter()
            .map(String::as_str)
            .filter(|t| !order.iter().any(|o| o == t))
            .collect();
        return Err(LoomError::Validation(format!(
            "dependency cycle involving: {}",
            stuck.join(", ")
        )));
    }

    Ok(ExecutionPlan {
        topological_order: order,
        batches,
    })
}

/// Materialize the per-project graph entity from current tasks and edges.
pub fn compute_graph(
    project_id: &str,
    tasks: &[AtomicTask],
    dependencies: &[Dependency],
) -> Result<DependencyGraph> {
    let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let edges: Vec<(String, String)> = dependencies
        .iter()
        .map(|d| (d.from_task.clone(), d.to_task.clone()))
        .collect();

    let plan = build_plan(&task_ids, &edges)?;

    let mut graph = DependencyGraph::empty(project_id);
    graph.edges = edges;
    graph.topological_order = plan.topological_order;
    graph.batches = plan.batches;
    graph.updated_at = Utc::now();
    Ok(graph)
}
