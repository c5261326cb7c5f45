//! System monitoring: periodic metric snapshots with bounded history and a
//! coarse health assessment.

use crate::agents::{AgentRegistry, TaskQueues};
use crate::constants::{MONITOR_HISTORY_CAPACITY, MONITOR_INTERVAL_SECS};
use crate::jobs::JobRegistry;
use crate::models::AgentState;
use crate::storage::{StorageEngine, StorageStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// System health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One snapshot of system state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: f64,
    pub health_status: HealthStatus,

    pub agents_total: usize,
    pub agents_idle: usize,
    pub agents_busy: usize,
    pub agents_offline: usize,
    pub agents_errored: usize,

    pub queued_tasks: usize,
    pub unassigned_tasks: usize,
    pub open_jobs: usize,
    pub notification_sessions: usize,

    pub storage: StorageStatsSnapshot,
}

/// Unassigned backlog beyond this is a degraded signal.
const BACKLOG_WARNING: usize = 100;

pub struct SystemMonitor {
    start_time: Instant,
    storage: StorageEngine,
    registry: Arc<AgentRegistry>,
    queues: Arc<TaskQueues>,
    jobs: Arc<JobRegistry>,
    bus: Arc<crate::notifications::NotificationBus>,
    history: RwLock<VecDeque<SystemMetrics>>,
}

impl SystemMonitor {
    pub fn new(
        storage: StorageEngine,
        registry: Arc<AgentRegistry>,
        queues: Arc<TaskQueues>,
        jobs: Arc<JobRegistry>,
        bus: Arc<crate::notifications::NotificationBus>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            storage,
            registry,
            queues,
            jobs,
            bus,
            history: RwLock::new(VecDeque::with_capacity(MONITOR_HISTORY_CAPACITY)),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Build a snapshot from live component state.
    pub fn collect(&self) -> SystemMetrics {
        let by_state = self.registry.counts_by_state();
        let agents_offline = *by_state.get(&AgentState::Offline).unwrap_or(&0);
        let agents_errored = *by_state.get(&AgentState::Error).unwrap_or(&0);
        let agents_total = self.registry.len();
        let unassigned = self.queues.unassigned_len();

        let health = if agents_errored > 0 && agents_errored >= agents_total.max(1) / 2 {
            HealthStatus::Unhealthy
        } else if unassigned > BACKLOG_WARNING
            || (agents_total > 0 && agents_offline == agents_total)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemMetrics {
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.uptime_seconds(),
            health_status: health,
            agents_total,
            agents_idle: *by_state.get(&AgentState::Idle).unwrap_or(&0),
            agents_busy: *by_state.get(&AgentState::Busy).unwrap_or(&0),
            agents_offline,
            agents_errored,
            queued_tasks: self.queues.total_queued(),
            unassigned_tasks: unassigned,
            open_jobs: self.jobs.len(),
            notification_sessions: self.bus.session_count(),
            storage: self.storage.stats_snapshot(),
        }
    }

    pub async fn record_snapshot(&self) -> SystemMetrics {
        let metrics = self.collect();
        let mut history = self.history.write().await;
        if history.len() >= MONITOR_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(metrics.clone());
        metrics
    }

    pub async fn get_current_metrics(&self) -> SystemMetrics {
        self.collect()
    }

    pub async fn get_metrics_history(&self) -> Vec<SystemMetrics> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.collect().health_status
    }

    /// Supervised collection loop; exits when the stop signal flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.record_snapshot().await; }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("system monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoomConfig;
    use crate::models::{AgentRecord, TransportKind};
    use crate::notifications::NotificationBus;
    use crate::security::locks::LockManager;

    async fn monitor() -> (tempfile::TempDir, SystemMonitor, Arc<AgentRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoomConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        let storage = StorageEngine::open(&config, LockManager::new(Duration::from_secs(5)))
            .await
            .unwrap();
        let registry = Arc::new(AgentRegistry::new());
        let monitor = SystemMonitor::new(
            storage,
            registry.clone(),
            Arc::new(TaskQueues::new()),
            Arc::new(JobRegistry::new(config.job.clone())),
            Arc::new(NotificationBus::new()),
        );
        (dir, monitor, registry)
    }

    #[tokio::test]
    async fn empty_system_is_healthy() {
        let (_dir, monitor, _registry) = monitor().await;
        let metrics = monitor.get_current_metrics().await;
        assert_eq!(metrics.health_status, HealthStatus::Healthy);
        assert_eq!(metrics.agents_total, 0);
    }

    #[tokio::test]
    async fn all_agents_offline_degrades_health() {
        let (_dir, monitor, registry) = monitor().await;
        let mut agent = AgentRecord::new("a1", vec![], TransportKind::Http);
        agent.state = AgentState::Offline;
        registry.register(agent, false).unwrap();

        assert_eq!(monitor.get_health_status().await, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        let (_dir, monitor, _registry) = monitor().await;
        monitor.record_snapshot().await;
        monitor.record_snapshot().await;

        let history = monitor.get_metrics_history().await;
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp <= history[1].timestamp);
    }
}
