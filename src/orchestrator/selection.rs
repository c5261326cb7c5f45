use crate::config::{OrchestratorConfig, SelectionStrategy};
use crate::models::{AgentRecord, AgentState, AtomicTask};

/// Capability match: |required ∩ capabilities| / |required|.
pub fn capability_score(agent: &AgentRecord, task: &AtomicTask) -> f64 {
    let required = task.required_skills();
    if required.is_empty() {
        return 1.0;
    }
    let matched = required
        .iter()
        .filter(|skill| agent.capabilities.iter().any(|c| c == *skill))
        .count();
    matched as f64 / required.len() as f64
}

/// Success rate weighted by inverse average completion time, normalised
/// into [0, 1]. A fresh agent scores the neutral 0.5.
pub fn performance_score(agent: &AgentRecord) -> f64 {
    if agent.performance.sample_count() == 0 {
        return 0.5;
    }
    let speed = 1.0 / (1.0 + agent.performance.avg_completion_ms / 60_000.0);
    agent.performance.success_rate * speed
}

pub fn availability_score(agent: &AgentRecord) -> f64 {
    (1.0 - agent.current_load()).clamp(0.0, 1.0)
}

pub fn hybrid_score(agent: &AgentRecord, task: &AtomicTask, config: &OrchestratorConfig) -> f64 {
    let w = &config.weights;
    w.capability * capability_score(agent, task)
        + w.performance * performance_score(agent)
        + w.availability * availability_score(agent)
}

fn candidates<'a>(agents: &'a [AgentRecord], task: &AtomicTask) -> Vec<&'a AgentRecord> {
    agents
        .iter()
        .filter(|a| {
            !matches!(a.state, AgentState::Offline | AgentState::Error)
                && a.current_tasks.len() < a.config.max_concurrent_tasks
                && capability_score(a, task) > 0.0
        })
        .collect()
}

/// Pick the best agent for `task`, or None when nobody qualifies.
///
/// Pure over its inputs: the round-robin cursor is threaded in by the caller.
pub fn select_agent(
    agents: &[AgentRecord],
    task: &AtomicTask,
    config: &OrchestratorConfig,
    round_robin_cursor: usize,
) -> Option<String> {
    let mut pool = candidates(agents, task);
    if pool.is_empty() {
        return None;
    }

    match config.strategy {
        SelectionStrategy::RoundRobin => {
            pool.sort_by(|a, b| a.id.cmp(&b.id));
            Some(pool[round_robin_cursor % pool.len()].id.clone())
        }
        SelectionStrategy::LeastLoaded => best_by(pool, |a| -a.current_load()),
        SelectionStrategy::CapabilityFirst => best_by(pool, |a| capability_score(a, task)),
        SelectionStrategy::IntelligentHybrid => best_by(pool, |a| hybrid_score(a, task, config)),
    }
}

/// Highest score wins; ties break toward the agent idle the longest.
fn best_by<F: Fn(&AgentRecord) -> f64>(pool: Vec<&AgentRecord>, score: F) -> Option<String> {
    pool.into_iter()
        .max_by(|a, b| {
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.performance
                        .last_active_at
                        .cmp(&a.performance.last_active_at)
                })
        })
        .map(|a| a.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskType, TransportKind};
    use chrono::{Duration, Utc};

    fn agent(id: &str, caps: &[&str]) -> AgentRecord {
        AgentRecord::new(
            id,
            caps.iter().map(|s| s.to_string()).collect(),
            TransportKind::Http,
        )
    }

    fn dev_task() -> AtomicTask {
        AtomicTask::new("p1", "e1", "implement parser", TaskType::Development)
    }

    #[test]
    fn capability_score_is_overlap_ratio() {
        let task = dev_task();
        assert!((capability_score(&agent("a", &["development"]), &task) - 1.0).abs() < 1e-9);
        assert!((capability_score(&agent("b", &["docs"]), &task)).abs() < 1e-9);
    }

    #[test]
    fn offline_error_and_full_agents_excluded() {
        let task = dev_task();
        let mut offline = agent("offline", &["development"]);
        offline.state = AgentState::Offline;
        let mut errored = agent("errored", &["development"]);
        errored.state = AgentState::Error;
        let mut full = agent("full", &["development"]);
        full.config.max_concurrent_tasks = 1;
        full.current_tasks.push("t0".into());

        let config = OrchestratorConfig::default();
        assert_eq!(
            select_agent(&[offline, errored, full], &task, &config, 0),
            None
        );
    }

    #[test]
    fn hybrid_prefers_capable_idle_agents() {
        let task = dev_task();
        let capable = agent("capable", &["development", "testing"]);
        let mut loaded = agent("loaded", &["development"]);
        loaded.config.max_concurrent_tasks = 4;
        loaded.current_tasks = vec!["t1".into(), "t2".into(), "t3".into()];

        let config = OrchestratorConfig::default();
        let picked = select_agent(&[loaded, capable], &task, &config, 0);
        assert_eq!(picked.as_deref(), Some("capable"));
    }

    #[test]
    fn least_loaded_picks_emptiest() {
        let task = dev_task();
        let mut busy = agent("busy", &["development"]);
        busy.config.max_concurrent_tasks = 4;
        busy.current_tasks = vec!["t1".into(), "t2".into()];
        let idle = agent("idle", &["development"]);

        let mut config = OrchestratorConfig::default();
        config.strategy = SelectionStrategy::LeastLoaded;
        assert_eq!(
            select_agent(&[busy, idle], &task, &config, 0).as_deref(),
            Some("idle")
        );
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let task = dev_task();
        let agents = vec![
            agent("a1", &["development"]),
            agent("a2", &["development"]),
            agent("a3", &["development"]),
        ];
        let mut config = OrchestratorConfig::default();
        config.strategy = SelectionStrategy::RoundRobin;

        let picks: Vec<String> = (0..4)
            .map(|cursor| select_agent(&agents, &task, &config, cursor).unwrap())
            .collect();
        assert_eq!(picks, vec!["a1", "a2", "a3", "a1"]);
    }

    #[test]
    fn ties_break_toward_longest_idle() {
        let task = dev_task();
        let mut fresh = agent("fresh", &["development"]);
        fresh.performance.last_active_at = Utc::now();
        let mut stale = agent("stale", &["development"]);
        stale.performance.last_active_at = Utc::now() - Duration::hours(2);

        let config = OrchestratorConfig::default();
        assert_eq!(
            select_agent(&[fresh, stale], &task, &config, 0).as_deref(),
            Some("stale")
        );
    }
}
