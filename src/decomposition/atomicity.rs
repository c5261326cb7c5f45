use crate::models::{AtomicTask, ProjectContext};
use serde::{Deserialize, Serialize};

/// The largest file set a single atomic task may touch.
const MAX_ATOMIC_FILES: usize = 5;

/// Minimum length for an acceptance criterion to count as concrete.
const MIN_CRITERION_LEN: usize = 10;

/// Skills beyond this many stop being "a small subset" of the stack.
const MAX_SKILLS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicityViolation {
    MultipleConcerns,
    EffortTooHigh,
    UnboundedFileSet,
    VagueAcceptanceCriteria,
    SkillSpread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicityAnalysis {
    pub is_atomic: bool,
    pub violations: Vec<AtomicityViolation>,
    pub confidence: f64,
}

/// Phrases that signal a task sprawls across the codebase.
const SPRAWL_MARKERS: &[&str] = &["all files", "entire", "every module", "across the codebase"];

/// Conjunctions that usually join two separate concerns in a title.
const CONJUNCTIONS: &[&str] = &[" and ", " then ", " plus ", "; "];

/// A task is atomic when all five predicates hold: single functional
/// concern, effort under the ceiling, bounded file set, concrete acceptance
/// criteria, and skills that are a small subset of the project stack.
pub fn analyze(task: &AtomicTask, ctx: &ProjectContext, ceiling_hours: f64) -> AtomicityAnalysis {
    let mut violations = Vec::new();

    let title = task.title.to_lowercase();
    if CONJUNCTIONS.iter().any(|c| title.contains(c)) {
        violations.push(AtomicityViolation::MultipleConcerns);
    }

    if task.estimated_hours > ceiling_hours {
        violations.push(AtomicityViolation::EffortTooHigh);
    }

    let description = task.description.to_lowercase();
    if task.file_paths.len() > MAX_ATOMIC_FILES
        || SPRAWL_MARKERS.iter().any(|m| description.contains(m))
    {
        violations.push(AtomicityViolation::UnboundedFileSet);
    }

    let concrete = !task.acceptance_criteria.is_empty()
        && task
            .acceptance_criteria
            .iter()
            .all(|c| c.trim().len() >= MIN_CRITERION_LEN);
    if !concrete {
        violations.push(AtomicityViolation::VagueAcceptanceCriteria);
    }

    let stack: Vec<String> = ctx
        .languages
        .iter()
        .chain(ctx.frameworks.iter())
        .map(|s| s.to_lowercase())
        .collect();
    let skills = task.required_skills();
    let extra_skills = skills
        .iter()
        .filter(|s| {
            let s = s.to_lowercase();
            !is_core_skill(&s) && !stack.iter().any(|k| k.contains(&s) || s.contains(k))
        })
        .count();
    if skills.len() > MAX_SKILLS || extra_skills > 0 {
        violations.push(AtomicityViolation::SkillSpread);
    }

    AtomicityAnalysis {
        is_atomic: violations.is_empty(),
        confidence: 1.0 - violations.len() as f64 / 5.0,
        violations,
    }
}

/// Skill tokens implied by the task type itself, always acceptable.
fn is_core_skill(skill: &str) -> bool {
    matches!(
        skill,
        "development" | "testing" | "research" | "docs" | "deployment"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;

    fn ctx() -> ProjectContext {
        ProjectContext {
            languages: vec!["typescript".to_string()],
            frameworks: vec!["express".to_string()],
            ..Default::default()
        }
    }

    fn well_formed() -> AtomicTask {
        AtomicTask::new("p1", "e1", "Add user model", TaskType::Development)
            .with_estimated_hours(2.0)
            .with_file_paths(vec!["src/models/user.ts".to_string()])
            .with_acceptance_criteria(vec![
                "User model persists email and password hash".to_string(),
            ])
    }

    #[test]
    fn well_formed_task_is_atomic() {
        let analysis = analyze(&well_formed(), &ctx(), 4.0);
        assert!(analysis.is_atomic);
        assert!(analysis.violations.is_empty());
        assert!((analysis.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn conjunction_in_title_flags_multiple_concerns() {
        let mut task = well_formed();
        task.title = "Add user model and wire up routes".to_string();
        let analysis = analyze(&task, &ctx(), 4.0);
        assert!(!analysis.is_atomic);
        assert!(analysis
            .violations
            .contains(&AtomicityViolation::MultipleConcerns));
    }

    #[test]
    fn effort_above_ceiling_is_flagged() {
        let task = well_formed().with_estimated_hours(6.0);
        let analysis = analyze(&task, &ctx(), 4.0);
        assert!(analysis.violations.contains(&AtomicityViolation::EffortTooHigh));
    }

    #[test]
    fn sprawling_file_set_is_flagged() {
        let mut task = well_formed();
        task.description = "Refactor logging across the codebase".to_string();
        let analysis = analyze(&task, &ctx(), 4.0);
        assert!(analysis
            .violations
            .contains(&AtomicityViolation::UnboundedFileSet));
    }

    #[test]
    fn empty_acceptance_criteria_are_vague() {
        let mut task = well_formed();
        task.acceptance_criteria.clear();
        let analysis = analyze(&task, &ctx(), 4.0);
        assert!(analysis
            .violations
            .contains(&AtomicityViolation::VagueAcceptanceCriteria));
    }

    #[test]
    fn foreign_skill_tag_is_skill_spread() {
        let mut task = well_formed();
        task.tags.push("skill:embedded-firmware".to_string());
        let analysis = analyze(&task, &ctx(), 4.0);
        assert!(analysis.violations.contains(&AtomicityViolation::SkillSpread));
    }
}
