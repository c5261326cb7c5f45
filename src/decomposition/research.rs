use crate::models::{AtomicTask, Priority, ProjectContext, TaskType};
use serde::{Deserialize, Serialize};

/// Effort beyond `RESEARCH_EFFORT_FACTOR × ceiling` suggests unknown territory.
const RESEARCH_EFFORT_FACTOR: f64 = 4.0;

/// Phrases that usually mean the team is adopting something new.
const NOVELTY_MARKERS: &[&str] = &[
    "integrate",
    "migrate to",
    "evaluate",
    "proof of concept",
    "spike",
    "new framework",
    "unfamiliar",
];

/// Everyday words that should never count as unfamiliar domain terms.
const COMMON_WORDS: &[&str] = &[
    "implement", "implementing", "function", "endpoint", "database", "refactor", "response",
    "request", "registration", "interface", "component", "configure", "validation", "middleware",
    "documentation", "deployment", "testing", "integration", "authentication", "authorization",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchDecision {
    pub should_research: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Decide whether a task needs a research pass before decomposition.
pub fn evaluate(task: &AtomicTask, ctx: &ProjectContext, ceiling_hours: f64) -> ResearchDecision {
    let mut signals: Vec<String> = Vec::new();
    let text = format!("{} {}", task.title, task.description).to_lowercase();

    let unfamiliar = unfamiliar_terms(&text, ctx);
    if !unfamiliar.is_empty() {
        signals.push(format!("unfamiliar terms: {}", unfamiliar.join(", ")));
    }

    if task.estimated_hours > RESEARCH_EFFORT_FACTOR * ceiling_hours {
        signals.push(format!(
            "effort {}h far above the {}h ceiling",
            task.estimated_hours, ceiling_hours
        ));
    }

    if task.priority == Priority::Critical && task.task_type == TaskType::Deployment {
        signals.push("critical deployment carries very high risk".to_string());
    }

    if NOVELTY_MARKERS.iter().any(|m| text.contains(m)) {
        signals.push("explicit adoption of novel technology".to_string());
    }

    let confidence = (signals.len() as f64 / 4.0).min(1.0);
    ResearchDecision {
        should_research: !signals.is_empty(),
        confidence,
        reason: if signals.is_empty() {
            "no research signals".to_string()
        } else {
            signals.join("; ")
        },
    }
}

/// Long tokens that appear in the task but match nothing in the project
/// stack or the common vocabulary.
fn unfamiliar_terms(text: &str, ctx: &ProjectContext) -> Vec<String> {
    let known: Vec<String> = ctx
        .languages
        .iter()
        .chain(ctx.frameworks.iter())
        .map(|s| s.to_lowercase())
        .collect();

    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() >= 8)
        .filter(|w| !COMMON_WORDS.contains(w))
        .filter(|w| !known.iter().any(|k| k.contains(*w) || w.contains(k.as_str())))
        .map(str::to_string)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}
