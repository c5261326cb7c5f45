use crate::models::{AgentRecord, AgentState};
use crate::{LoomError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Registry of worker agents, keyed by agent id.
///
/// Snapshot reads are lock-free; all mutation goes through the entry guards
/// so each agent has a single writer at a time.
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Register an agent. Duplicate ids are refused unless `force` replaces
    /// the existing registration.
    pub fn register(&self, agent: AgentRecord, force: bool) -> Result<AgentRecord> {
        if !force && self.agents.contains_key(&agent.id) {
            warn!(agent_id = %agent.id, "duplicate agent registration");
            return Err(LoomError::AlreadyExists(format!("agent {}", agent.id)));
        }
        info!(agent_id = %agent.id, transport = ?agent.transport, "agent registered");
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    pub fn unregister(&self, agent_id: &str) -> Result<()> {
        self.agents
            .remove(agent_id)
            .map(|_| info!(agent_id, "agent unregistered"))
            .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Apply a closure to one agent under its write guard.
    pub fn update<F: FnOnce(&mut AgentRecord)>(&self, agent_id: &str, f: F) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))?;
        f(&mut agent);
        Ok(())
    }

    pub fn update_state(&self, agent_id: &str, state: AgentState) -> Result<()> {
        self.update(agent_id, |a| a.state = state)
    }

    /// Record a heartbeat; an offline agent that resumes beating comes back
    /// as idle.
    pub fn update_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |a| {
            a.last_heartbeat = Utc::now();
            if a.state == AgentState::Offline {
                debug!(agent_id, "agent back online");
                a.state = AgentState::Idle;
            }
        })
    }

    /// Attach a task to the agent; flips to busy at the concurrency ceiling.
    pub fn task_started(&self, agent_id: &str, task_id: &str) -> Result<()> {
        self.update(agent_id, |a| {
            if !a.current_tasks.iter().any(|t| t == task_id) {
                a.current_tasks.push(task_id.to_string());
            }
            if a.current_tasks.len() >= a.config.max_concurrent_tasks {
                a.state = AgentState::Busy;
            }
        })
    }

    /// Detach a finished task and fold the outcome into the performance record.
    pub fn task_finished(
        &self,
        agent_id: &str,
        task_id: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<()> {
        self.update(agent_id, |a| {
            a.current_tasks.retain(|t| t != task_id);
            a.performance.record(success, duration_ms);
            if a.state == AgentState::Busy && a.current_tasks.len() < a.config.max_concurrent_tasks
            {
                a.state = AgentState::Idle;
            }
        })
    }

    /// Agents whose last heartbeat predates `now - timeout` and are not
    /// already offline.
    pub fn stale_agents(&self, timeout_secs: u64) -> Vec<AgentRecord> {
        let cutoff = Utc::now() - ChronoDuration::seconds(timeout_secs as i64);
        self.agents
            .iter()
            .filter(|a| a.state != AgentState::Offline && a.last_heartbeat < cutoff)
            .map(|a| a.clone())
            .collect()
    }

    pub fn counts_by_state(&self) -> HashMap<AgentState, usize> {
        let mut counts = HashMap::new();
        for agent in self.agents.iter() {
            *counts.entry(agent.state).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
