use crate::agents::{AgentRegistry, TaskQueues};
use crate::models::{AgentRecord, AgentState, AtomicTask};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Samples needed before a prediction is fully trusted.
const CONFIDENCE_KNEE: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImbalanceReport {
    pub overloaded: Vec<String>,
    pub underloaded: Vec<String>,
    pub threshold: f64,
}

impl ImbalanceReport {
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() || self.underloaded.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionPrediction {
    pub agent_id: String,
    pub task_id: String,
    pub estimated_ms: u64,
    pub confidence: f64,
}

/// Workload balancing over the agent pool.
pub struct WorkloadBalancer {
    registry: Arc<AgentRegistry>,
    queues: Arc<TaskQueues>,
    threshold: f64,
}

impl WorkloadBalancer {
    pub fn new(registry: Arc<AgentRegistry>, queues: Arc<TaskQueues>, threshold: f64) -> Self {
        Self {
            registry,
            queues,
            threshold,
        }
    }

    /// Agents loaded at or above the threshold vs. those with most headroom.
    pub fn detect_workload_imbalance(&self) -> ImbalanceReport {
        let mut overloaded = Vec::new();
        let mut underloaded = Vec::new();

        for agent in self.registry.list() {
            if matches!(agent.state, AgentState::Offline | AgentState::Error) {
                continue;
            }
            let load = agent.current_load();
            if load >= self.threshold {
                overloaded.push(agent.id);
            } else if load <= 1.0 - self.threshold {
                underloaded.push(agent.id);
            }
        }
        overloaded.sort();
        underloaded.sort();

        ImbalanceReport {
            overloaded,
            underloaded,
            threshold: self.threshold,
        }
    }

    /// Move still-queued (never delivered) descriptors from overloaded to
    /// underloaded agents. Returns the migrations performed.
    pub fn rebalance_workload(&self) -> Vec<Migration> {
        let report = self.detect_workload_imbalance();
        if report.is_balanced() {
            return Vec::new();
        }

        let mut migrations = Vec::new();
        let mut targets = report.underloaded.iter().cycle();

        for source in &report.overloaded {
            // Only backlog entries move; anything already delivered stays put.
            let backlog = self.queues.get_tasks(source, usize::MAX);
            for descriptor in backlog {
                let Some(target) = targets.next() else { break };
                let Some(agent) = self.registry.get(target) else {
                    let _ = self.queues.push_unassigned(descriptor);
                    continue;
                };
                match self
                    .queues
                    .add_task(target, descriptor.clone(), agent.config.max_concurrent_tasks)
                {
                    Ok(()) => {
                        migrations.push(Migration {
                            task_id: descriptor.task_id,
                            from_agent: source.clone(),
                            to_agent: target.clone(),
                        });
                    }
                    Err(_) => {
                        // Target filled up mid-rebalance; park instead of losing it.
                        let _ = self.queues.push_unassigned(descriptor);
                    }
                }
            }
        }

        if !migrations.is_empty() {
            info!(count = migrations.len(), "rebalanced queued tasks");
        }
        migrations
    }

    /// Estimate completion from the agent's history and the task's stated
    /// effort; confidence grows with sample count.
    pub fn predict_task_completion(
        &self,
        agent: &AgentRecord,
        task: &AtomicTask,
    ) -> CompletionPrediction {
        let effort_ms = (task.estimated_hours * 3_600_000.0).max(0.0);
        let samples = agent.performance.sample_count() as f64;

        let estimated_ms = if samples == 0.0 {
            effort_ms
        } else {
            // Blend history toward the stated effort as evidence thins out.
            let trust = samples / (samples + CONFIDENCE_KNEE);
            agent.performance.avg_completion_ms * trust + effort_ms * (1.0 - trust)
        };

        CompletionPrediction {
            agent_id: agent.id.clone(),
            task_id: task.id.clone(),
            estimated_ms: estimated_ms as u64,
            confidence: samples / (samples + CONFIDENCE_KNEE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskDescriptor, TaskType, TransportKind};

    fn setup(threshold: f64) -> (Arc<AgentRegistry>, Arc<TaskQueues>, WorkloadBalancer) {
        let registry = Arc::new(AgentRegistry::new());
        let queues = Arc::new(TaskQueues::new());
        let balancer = WorkloadBalancer::new(registry.clone(), queues.clone(), threshold);
        (registry, queues, balancer)
    }

    fn agent(id: &str, max: usize, held: usize) -> AgentRecord {
        let mut a = AgentRecord::new(id, vec!["development".into()], TransportKind::Http);
        a.config.max_concurrent_tasks = max;
        a.current_tasks = (0..held).map(|i| format!("{id}-t{i}")).collect();
        a
    }

    fn descriptor(task_id: &str) -> TaskDescriptor {
        let mut task = AtomicTask::new("p1", "e1", task_id, TaskType::Development);
        task.id = task_id.to_string();
        TaskDescriptor::from_task(&task, None)
    }

    #[test]
    fn imbalance_detection_buckets_by_load() {
        let (registry, _queues, balancer) = setup(0.75);
        registry.register(agent("hot", 4, 4), false).unwrap();
        registry.register(agent("cold", 4, 0), false).unwrap();
        registry.register(agent("mid", 4, 2), false).unwrap();

        let report = balancer.detect_workload_imbalance();
        assert_eq!(report.overloaded, vec!["hot"]);
        assert_eq!(report.underloaded, vec!["cold"]);
    }

    #[test]
    fn rebalance_moves_queued_tasks() {
        let (registry, queues, balancer) = setup(0.75);
        registry.register(agent("hot", 2, 2), false).unwrap();
        registry.register(agent("cold", 2, 0), false).unwrap();

        queues.add_task("hot", descriptor("q1"), 2).unwrap();
        queues.add_task("hot", descriptor("q2"), 2).unwrap();

        let migrations = balancer.rebalance_workload();
        assert_eq!(migrations.len(), 2);
        assert!(migrations.iter().all(|m| m.to_agent == "cold"));
        assert_eq!(queues.len("hot"), 0);
        assert_eq!(queues.len("cold"), 2);
    }

    #[test]
    fn balanced_pool_yields_no_migrations() {
        let (registry, queues, balancer) = setup(0.75);
        registry.register(agent("a", 4, 2), false).unwrap();
        registry.register(agent("b", 4, 2), false).unwrap();
        queues.add_task("a", descriptor("q1"), 4).unwrap();

        assert!(balancer.rebalance_workload().is_empty());
        assert_eq!(queues.len("a"), 1);
    }

    #[test]
    fn prediction_blends_history_and_effort() {
        let (_registry, _queues, balancer) = setup(0.75);
        let task = AtomicTask::new("p1", "e1", "t", TaskType::Development)
            .with_estimated_hours(1.0);

        let fresh = agent("fresh", 2, 0);
        let p = balancer.predict_task_completion(&fresh, &task);
        assert_eq!(p.estimated_ms, 3_600_000);
        assert!(p.confidence < f64::EPSILON);

        let mut seasoned = agent("seasoned", 2, 0);
        for _ in 0..20 {
            seasoned.performance.record(true, 600_000);
        }
        let p = balancer.predict_task_completion(&seasoned, &task);
        assert!(p.confidence > 0.7);
        assert!(p.estimated_ms < 1_800_000, "{}", p.estimated_ms);
    }
}
