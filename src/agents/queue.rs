use crate::constants::{MAX_UNASSIGNED_POOL, QUEUE_BACKLOG_FACTOR};
use crate::models::TaskDescriptor;
use crate::{LoomError, Result};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, info};

/// Per-agent FIFO task queues plus the global unassigned pool.
///
/// Each queue has a single writer at a time (the dashmap entry guard);
/// `get_tasks` pops atomically so two pickups never see the same descriptor.
pub struct TaskQueues {
    queues: DashMap<String, VecDeque<TaskDescriptor>>,
    unassigned: Mutex<VecDeque<TaskDescriptor>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            unassigned: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue bound for an agent with the given concurrency ceiling.
    pub fn bound_for(max_concurrent_tasks: usize) -> usize {
        max_concurrent_tasks.max(1) * QUEUE_BACKLOG_FACTOR
    }

    /// Append a descriptor to the agent's queue; overflow is refused.
    pub fn add_task(
        &self,
        agent_id: &str,
        descriptor: TaskDescriptor,
        max_concurrent_tasks: usize,
    ) -> Result<()> {
        let mut queue = self.queues.entry(agent_id.to_string()).or_default();
        if queue.len() >= Self::bound_for(max_concurrent_tasks) {
            return Err(LoomError::QueueFull(format!("agent {agent_id}")));
        }
        debug!(agent_id, task_id = %descriptor.task_id, position = queue.len(), "task queued");
        queue.push_back(descriptor);
        Ok(())
    }

    /// Atomically pop up to `max` descriptors from the head.
    pub fn get_tasks(&self, agent_id: &str, max: usize) -> Vec<TaskDescriptor> {
        let Some(mut queue) = self.queues.get_mut(agent_id) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn len(&self, agent_id: &str) -> usize {
        self.queues.get(agent_id).map_or(0, |q| q.len())
    }

    /// Remove a task wherever it is queued; true when something was removed.
    pub fn remove_task(&self, task_id: &str) -> bool {
        if self.remove_queued(task_id) {
            return true;
        }
        let mut pool = self.unassigned.lock().unwrap_or_else(|e| e.into_inner());
        let before = pool.len();
        pool.retain(|d| d.task_id != task_id);
        pool.len() != before
    }

    /// Remove a task from per-agent queues only; a descriptor already
    /// reclaimed to the unassigned pool stays there.
    pub fn remove_queued(&self, task_id: &str) -> bool {
        for mut queue in self.queues.iter_mut() {
            let before = queue.len();
            queue.retain(|d| d.task_id != task_id);
            if queue.len() != before {
                return true;
            }
        }
        false
    }

    /// Drain an agent's queue back to the unassigned pool (offline
    /// reclamation); returns what was reclaimed.
    pub fn reclaim(&self, agent_id: &str) -> Vec<TaskDescriptor> {
        let drained: Vec<TaskDescriptor> = self
            .queues
            .get_mut(agent_id)
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default();

        if !drained.is_empty() {
            info!(agent_id, count = drained.len(), "reclaiming queued tasks");
            let mut pool = self.unassigned.lock().unwrap_or_else(|e| e.into_inner());
            for descriptor in &drained {
                if pool.len() < MAX_UNASSIGNED_POOL {
                    pool.push_back(descriptor.clone());
                }
            }
        }
        drained
    }

    pub fn push_unassigned(&self, descriptor: TaskDescriptor) -> Result<()> {
        let mut pool = self.unassigned.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() >= MAX_UNASSIGNED_POOL {
            return Err(LoomError::QueueFull("unassigned pool".to_string()));
        }
        pool.push_back(descriptor);
        Ok(())
    }

    pub fn drain_unassigned(&self, max: usize) -> Vec<TaskDescriptor> {
        let mut pool = self.unassigned.lock().unwrap_or_else(|e| e.into_inner());
        let take = max.min(pool.len());
        pool.drain(..take).collect()
    }

    pub fn unassigned_len(&self) -> usize {
        self.unassigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn total_queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum::<usize>() + self.unassigned_len()
    }
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self::new()
    }
}
