use super::atomicity::{self, AtomicityAnalysis};
use crate::constants::{
    CHUNK_WORKER_POOL, DUPLICATE_JACCARD_THRESHOLD, FILE_SCORE_CHUNK_SIZE, LLM_MIN_COVERAGE,
};
use crate::llm::CompletionClient;
use crate::models::{AtomicTask, ProjectContext, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskValidation {
    pub task_id: String,
    pub title: String,
    pub atomicity: AtomicityAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub first: String,
    pub second: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchValidation {
    pub per_task: Vec<TaskValidation>,
    pub duplicates: Vec<DuplicatePair>,
    pub total_effort_hours: f64,
    pub skill_distribution: HashMap<String, usize>,
    pub recommendations: Vec<String>,
}

/// Normalised token Jaccard over two titles.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// Cross-task validation of a candidate batch.
pub fn validate_batch(
    tasks: &[AtomicTask],
    ctx: &ProjectContext,
    ceiling_hours: f64,
) -> BatchValidation {
    let per_task: Vec<TaskValidation> = tasks
        .iter()
        .map(|t| TaskValidation {
            task_id: t.id.clone(),
            title: t.title.clone(),
            atomicity: atomicity::analyze(t, ctx, ceiling_hours),
        })
        .collect();

    let mut duplicates = Vec::new();
    for (i, a) in tasks.iter().enumerate() {
        for b in tasks.iter().skip(i + 1) {
            let similarity = title_similarity(&a.title, &b.title);
            if similarity >= DUPLICATE_JACCARD_THRESHOLD {
                duplicates.push(DuplicatePair {
                    first: a.id.clone(),
                    second: b.id.clone(),
                    similarity,
                });
            }
        }
    }

    let total_effort_hours = tasks.iter().map(|t| t.estimated_hours).sum();

    let mut skill_distribution: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        for skill in task.required_skills() {
            *skill_distribution.entry(skill).or_default() += 1;
        }
    }

    let mut recommendations = Vec::new();
    for validation in &per_task {
        if !validation.atomicity.is_atomic {
            recommendations.push(format!(
                "split or tighten '{}' ({} atomicity violation(s))",
                validation.title,
                validation.atomicity.violations.len()
            ));
        }
    }
    for dup in &duplicates {
        recommendations.push(format!(
            "merge near-duplicate tasks {} and {} (similarity {:.2})",
            dup.first, dup.second, dup.similarity
        ));
    }
    if !tasks.is_empty() && !tasks.iter().any(|t| t.task_type == TaskType::Testing) {
        recommendations.push("batch has no testing tasks; add coverage".to_string());
    }

    BatchValidation {
        per_task,
        duplicates,
        total_effort_hours,
        skill_distribution,
        recommendations,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileScore {
    pub path: String,
    pub score: f64,
    pub reason: String,
    pub auto_generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringReport {
    pub scores: Vec<FileScore>,
    pub chunking_used: bool,
    pub total_chunks: usize,
    pub failed_chunks: usize,
}

#[derive(Debug, Deserialize)]
struct RawScore {
    path: String,
    score: f64,
    #[serde(default)]
    reason: String,
}

const STRICT_RETRY_SUFFIX: &str = "\nReturn ONLY a JSON array of {\"path\", \"score\", \"reason\"} \
objects, one per input file, scores in [0,1]. No prose.";

/// Score each file's relevance to a task, chunking large inputs through a
/// fixed-size worker pool.
///
/// A chunk whose replies stay malformed after one strict retry degrades to
/// default-scored entries marked `auto_generated`; the report always covers
/// every input file, in input order.
pub async fn score_file_relevance(
    llm: Arc<dyn CompletionClient>,
    task_description: &str,
    files: &[String],
) -> ScoringReport {
    if files.is_empty() {
        return ScoringReport {
            scores: Vec::new(),
            chunking_used: false,
            total_chunks: 0,
            failed_chunks: 0,
        };
    }

    let chunks: Vec<Vec<String>> = files
        .chunks(FILE_SCORE_CHUNK_SIZE)
        .map(|c| c.to_vec())
        .collect();
    let total_chunks = chunks.len();
    let chunking_used = total_chunks > 1;
    let semaphore = Arc::new(Semaphore::new(CHUNK_WORKER_POOL));

    let futures = chunks.into_iter().enumerate().map(|(index, chunk)| {
        let llm = llm.clone();
        let semaphore = semaphore.clone();
        let description = task_description.to_string();
        async move {
            let _permit = semaphore.acquire().await.expect("scoring semaphore closed");
            score_chunk(llm.as_ref(), &description, &chunk, index).await
        }
    });

    let chunk_results = futures::future::join_all(futures).await;

    let mut by_path: HashMap<String, FileScore> = HashMap::new();
    let mut failed_chunks = 0;
    for (scores, failed) in chunk_results {
        if failed {
            failed_chunks += 1;
        }
        for score in scores {
            by_path.insert(score.path.clone(), score);
        }
    }

    // Input order, with defaults for anything a partial reply skipped.
    let scores: Vec<FileScore> = files
        .iter()
        .map(|path| {
            by_path.remove(path).unwrap_or_else(|| default_score(path))
        })
        .collect();

    ScoringReport {
        scores,
        chunking_used,
        total_chunks,
        failed_chunks,
    }
}

async fn score_chunk(
    llm: &dyn CompletionClient,
    task_description: &str,
    chunk: &[String],
    index: usize,
) -> (Vec<FileScore>, bool) {
    let base_prompt = format!(
        "Score each file's relevance to this task (0 to 1).\nTask: {task_description}\nFiles:\n{}",
        chunk.join("\n")
    );

    for (attempt, prompt) in [
        base_prompt.clone(),
        format!("{base_prompt}{STRICT_RETRY_SUFFIX}"),
    ]
    .into_iter()
    .enumerate()
    {
        match llm.complete(&prompt).await {
            Ok(text) => {
                if let Some(scores) = parse_scores(&text, chunk) {
                    debug!(chunk = index, attempt, "chunk scored");
                    return (scores, false);
                }
                warn!(chunk = index, attempt, "malformed scoring reply");
            }
            Err(e) => warn!(chunk = index, attempt, "scoring call failed: {e}"),
        }
    }

    // Both attempts failed: default-score the whole chunk.
    (chunk.iter().map(|p| default_score(p)).collect(), true)
}

/// Accept a reply when it is a JSON array covering enough of the chunk.
fn parse_scores(text: &str, chunk: &[String]) -> Option<Vec<FileScore>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    let raw: Vec<RawScore> = serde_json::from_str(&text[start..=end]).ok()?;

    let known: HashSet<&str> = chunk.iter().map(String::as_str).collect();
    let covered = raw.iter().filter(|r| known.contains(r.path.as_str())).count();
    if (covered as f64) < LLM_MIN_COVERAGE * chunk.len() as f64 {
        return None;
    }

    Some(
        raw.into_iter()
            .filter(|r| known.contains(r.path.as_str()))
            .map(|r| FileScore {
                path: r.path,
                score: r.score.clamp(0.0, 1.0),
                reason: r.reason,
                auto_generated: false,
            })
            .collect(),
    )
}

fn default_score(path: &str) -> FileScore {
    FileScore {
        path: path.to_string(),
        score: 0.5,
        reason: "default score".to_string(),
        auto_generated: true,
    }
}
