use crate::models::{AtomicTask, DependencyKind, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySuggestion {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
    pub confidence: f64,
    pub reason: String,
}

const MODEL_MARKERS: &[&str] = &["model", "schema", "entity", "migration"];
const CONSUMER_MARKERS: &[&str] = &["route", "controller", "handler", "endpoint", "service", "api"];
const CONFIG_MARKERS: &[&str] = &["config", "settings", "env"];

/// Infer ordering edges between sibling tasks.
///
/// Heuristics: model-before-consumer, implementation-before-test of the same
/// area, config-before-use, and shared-file collisions. Edges read
/// `from` runs before `to`.
pub fn infer(tasks: &[AtomicTask]) -> Vec<DependencySuggestion> {
    let mut suggestions: Vec<DependencySuggestion> = Vec::new();

    for a in tasks {
        for b in tasks {
            if a.id == b.id {
                continue;
            }

            if mentions(a, MODEL_MARKERS)
                && mentions(b, CONSUMER_MARKERS)
                && b.task_type == TaskType::Development
            {
                suggestions.push(DependencySuggestion {
                    from: a.id.clone(),
                    to: b.id.clone(),
                    kind: DependencyKind::Data,
                    confidence: 0.85,
                    reason: "data model must exist before its consumer".to_string(),
                });
            }

            if a.task_type == TaskType::Development
                && b.task_type == TaskType::Testing
                && shares_area(a, b)
            {
                suggestions.push(DependencySuggestion {
                    from: a.id.clone(),
                    to: b.id.clone(),
                    kind: DependencyKind::TaskOrder,
                    confidence: 0.9,
                    reason: "implementation precedes its tests".to_string(),
                });
            }

            if mentions(a, CONFIG_MARKERS)
                && !mentions(b, CONFIG_MARKERS)
                && shares_area(a, b)
            {
                suggestions.push(DependencySuggestion {
                    from: a.id.clone(),
                    to: b.id.clone(),
                    kind: DependencyKind::Resource,
                    confidence: 0.75,
                    reason: "configuration must land before first use".to_string(),
                });
            }

            if a.created_at < b.created_at {
                if let Some(path) = shared_file(a, b) {
                    suggestions.push(DependencySuggestion {
                        from: a.id.clone(),
                        to: b.id.clone(),
                        kind: DependencyKind::Resource,
                        confidence: 0.7,
                        reason: format!("both touch {path}; ordering avoids a collision"),
                    });
                }
            }
        }
    }

    dedupe(suggestions)
}

/// Keep one suggestion per ordered pair (highest confidence wins) and drop
/// the weaker direction when both were proposed.
fn dedupe(mut suggestions: Vec<DependencySuggestion>) -> Vec<DependencySuggestion> {
    suggestions.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<DependencySuggestion> = Vec::new();
    let mut pairs: HashSet<(String, String)> = HashSet::new();
    for s in suggestions {
        let forward = (s.from.clone(), s.to.clone());
        let reverse = (s.to.clone(), s.from.clone());
        if pairs.contains(&forward) || pairs.contains(&reverse) {
            continue;
        }
        pairs.insert(forward);
        kept.push(s);
    }
    kept
}

fn mentions(task: &AtomicTask, markers: &[&str]) -> bool {
    let text = format!(
        "{} {} {}",
        task.title.to_lowercase(),
        task.description.to_lowercase(),
        task.file_paths.join(" ").to_lowercase()
    );
    markers.iter().any(|m| text.contains(m))
}

/// Two tasks share an area when their titles overlap on a meaningful token
/// or they name files with a common stem.
fn shares_area(a: &AtomicTask, b: &AtomicTask) -> bool {
    let tokens_a = meaningful_tokens(&a.title);
    let tokens_b = meaningful_tokens(&b.title);
    if tokens_a.intersection(&tokens_b).next().is_some() {
        return true;
    }
    let stems_a: HashSet<String> = a.file_paths.iter().filter_map(|p| stem(p)).collect();
    b.file_paths.iter().filter_map(|p| stem(p)).any(|s| stems_a.contains(&s))
}

fn shared_file(a: &AtomicTask, b: &AtomicTask) -> Option<String> {
    let files_a: HashSet<&str> = a.file_paths.iter().map(String::as_str).collect();
    b.file_paths
        .iter()
        .find(|p| files_a.contains(p.as_str()))
        .cloned()
}

fn stem(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn meaningful_tokens(text: &str) -> HashSet<String> {
    const STOP: &[&str] = &["the", "for", "and", "with", "add", "write", "create", "implement"];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3 && !STOP.contains(t))
        .map(str::to_string)
        .collect()
}

/// Partition suggestions by the auto-apply threshold.
pub fn partition(
    suggestions: Vec<DependencySuggestion>,
    threshold: f64,
) -> (Vec<DependencySuggestion>, Vec<DependencySuggestion>) {
    let mut grouped: HashMap<bool, Vec<DependencySuggestion>> = HashMap::new();
    for s in suggestions {
        grouped.entry(s.confidence >= threshold).or_default().push(s);
    }
    (
        grouped.remove(&true).unwrap_or_default(),
        grouped.remove(&false).unwrap_or_default(),
    )
}
