use super::{AgentRegistry, TaskQueues};
use crate::constants::HEARTBEAT_SWEEP_INTERVAL_SECS;
use crate::models::AgentState;
use crate::notifications::NotificationBus;
use crate::orchestrator::ExecutionTracker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Moves silent agents offline and reclaims their work.
pub struct HeartbeatSweeper {
    registry: Arc<AgentRegistry>,
    queues: Arc<TaskQueues>,
    bus: Arc<NotificationBus>,
    tracker: Arc<ExecutionTracker>,
    timeout_secs: u64,
}

impl HeartbeatSweeper {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queues: Arc<TaskQueues>,
        bus: Arc<NotificationBus>,
        tracker: Arc<ExecutionTracker>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            queues,
            bus,
            tracker,
            timeout_secs,
        }
    }

    /// One pass: returns the ids of agents taken offline.
    pub fn sweep_once(&self) -> Vec<String> {
        let stale = self.registry.stale_agents(self.timeout_secs);
        let mut offlined = Vec::with_capacity(stale.len());

        for agent in stale {
            warn!(agent_id = %agent.id, "heartbeat lost, marking agent offline");
            if self
                .registry
                .update(&agent.id, |a| {
                    a.state = AgentState::Offline;
                    a.current_tasks.clear();
                })
                .is_err()
            {
                continue;
            }

            let reclaimed = self.queues.reclaim(&agent.id);
            let aborted = self.tracker.abort_for_agent(&agent.id);
            self.bus.broadcast(
                "agent_offline",
                &serde_json::json!({
                    "agentId": agent.id,
                    "reclaimedTasks": reclaimed.iter().map(|d| d.task_id.clone()).collect::<Vec<_>>(),
                    "abortedExecutions": aborted,
                }),
            );
            offlined.push(agent.id);
        }
        offlined
    }

    /// Supervised loop; exits when the stop signal flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep_once(); }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("heartbeat sweeper stopping");
                        return;
                    }
                }
            }
        }
    }
}
