//! Explicit system lifecycle: every component is constructed once here and
//! threaded into its dependents; background loops are supervised and wind
//! down on a shared stop signal.

use crate::agents::{AgentRegistry, HeartbeatSweeper, TaskQueues};
use crate::config::LoomConfig;
use crate::decomposition::DecompositionEngine;
use crate::jobs::JobRegistry;
use crate::llm::{CompletionClient, HttpCompletionClient};
use crate::monitoring::SystemMonitor;
use crate::notifications::NotificationBus;
use crate::orchestrator::{
    DeliveryRouter, ExecutionTracker, Orchestrator, WorkloadBalancer,
};
use crate::rate_limit::RateLimiters;
use crate::response::ResponseProcessor;
use crate::security::SecurityGateway;
use crate::storage::StorageEngine;
use crate::transport::{TransportManager, TransportState};
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// The assembled system.
pub struct Loom {
    pub config: Arc<LoomConfig>,
    pub security: Arc<SecurityGateway>,
    pub storage: StorageEngine,
    pub jobs: Arc<JobRegistry>,
    pub bus: Arc<NotificationBus>,
    pub registry: Arc<AgentRegistry>,
    pub queues: Arc<TaskQueues>,
    pub tracker: Arc<ExecutionTracker>,
    pub delivery: Arc<DeliveryRouter>,
    pub processor: Arc<ResponseProcessor>,
    pub orchestrator: Arc<Orchestrator>,
    pub decomposition: Arc<DecompositionEngine>,
    pub balancer: Arc<WorkloadBalancer>,
    pub monitor: Arc<SystemMonitor>,
    pub rate_limits: Arc<RateLimiters>,
    pub transports: TransportManager,
    stop_tx: watch::Sender<bool>,
}

impl Loom {
    pub async fn new(config: LoomConfig) -> Result<Arc<Self>> {
        let llm: Arc<dyn CompletionClient> = Arc::new(HttpCompletionClient::new(
            config.llm.clone(),
            config.timeouts.llm_secs,
        ));
        Self::with_llm(config, llm).await
    }

    /// Construction with an injected completion client (tests swap in a
    /// scripted one).
    pub async fn with_llm(
        config: LoomConfig,
        llm: Arc<dyn CompletionClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let security = Arc::new(SecurityGateway::new(&config));
        let storage = StorageEngine::open(&config, security.locks.clone()).await?;

        let jobs = Arc::new(JobRegistry::new(config.job.clone()));
        let bus = Arc::new(NotificationBus::new());
        let registry = Arc::new(AgentRegistry::new());
        let queues = Arc::new(TaskQueues::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let delivery = Arc::new(DeliveryRouter::new(bus.clone()));

        let processor = Arc::new(ResponseProcessor::new(
            storage.clone(),
            jobs.clone(),
            bus.clone(),
            registry.clone(),
            queues.clone(),
            tracker.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.clone(),
            config.timeouts.clone(),
            storage.clone(),
            security.locks.clone(),
            registry.clone(),
            queues.clone(),
            jobs.clone(),
            bus.clone(),
            tracker.clone(),
            delivery.clone(),
        ));

        let decomposition = Arc::new(DecompositionEngine::new(
            config.decomposition.clone(),
            storage.clone(),
            llm,
        ));

        let balancer = Arc::new(WorkloadBalancer::new(
            registry.clone(),
            queues.clone(),
            config.orchestrator.workload_balance_threshold,
        ));

        let monitor = Arc::new(SystemMonitor::new(
            storage.clone(),
            registry.clone(),
            queues.clone(),
            jobs.clone(),
            bus.clone(),
        ));

        let rate_limits = Arc::new(RateLimiters::new());
        let transport_state = TransportState {
            config: config.clone(),
            registry: registry.clone(),
            queues: queues.clone(),
            jobs: jobs.clone(),
            bus: bus.clone(),
            auth: security.auth.clone(),
            security: security.clone(),
            processor: processor.clone(),
            delivery: delivery.clone(),
            monitor: monitor.clone(),
            rate_limits: rate_limits.clone(),
        };
        let transports = TransportManager::new(transport_state);

        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            security,
            storage,
            jobs,
            bus,
            registry,
            queues,
            tracker,
            delivery,
            processor,
            orchestrator,
            decomposition,
            balancer,
            monitor,
            rate_limits,
            transports,
            stop_tx,
        }))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// A fresh handler-state view over the same components.
    pub fn transport_state(&self) -> TransportState {
        TransportState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            queues: self.queues.clone(),
            jobs: self.jobs.clone(),
            bus: self.bus.clone(),
            auth: self.security.auth.clone(),
            security: self.security.clone(),
            processor: self.processor.clone(),
            delivery: self.delivery.clone(),
            monitor: self.monitor.clone(),
            rate_limits: self.rate_limits.clone(),
        }
    }

    /// Start transports and the supervised background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transports.start_all(self.shutdown_signal()).await?;

        let sweeper = Arc::new(HeartbeatSweeper::new(
            self.registry.clone(),
            self.queues.clone(),
            self.bus.clone(),
            self.tracker.clone(),
            self.config.orchestrator.heartbeat_timeout_secs,
        ));
        let stop = self.shutdown_signal();
        tokio::spawn(async move { sweeper.run(stop).await });

        let jobs = self.jobs.clone();
        let stop = self.shutdown_signal();
        tokio::spawn(async move { jobs.run_sweeper(stop).await });

        let monitor = self.monitor.clone();
        let stop = self.shutdown_signal();
        tokio::spawn(async move { monitor.run(stop).await });

        info!("taskloom started");
        Ok(())
    }

    /// Flip the stop signal; every supervised loop and transport observes it.
    pub fn shutdown(&self) {
        info!("taskloom shutting down");
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedCompletionClient;

    async fn world() -> (tempfile::TempDir, Arc<Loom>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoomConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();
        config.transport.http.port = 0;
        config.transport.websocket.port = 0;
        config.transport.stdio.enabled = false;
        let llm = Arc::new(ScriptedCompletionClient::new(vec![]));
        let loom = Loom::with_llm(config, llm).await.unwrap();
        (dir, loom)
    }

    #[tokio::test]
    async fn world_starts_and_stops() {
        let (_dir, loom) = world().await;
        loom.start().await.unwrap();
        assert!(loom.transports.is_running());

        loom.shutdown();
        let mut signal = loom.shutdown_signal();
        assert!(*signal.borrow_and_update());
    }

    #[tokio::test]
    async fn components_share_the_same_registry() {
        let (_dir, loom) = world().await;
        let agent = crate::models::AgentRecord::new(
            "a1",
            vec!["development".to_string()],
            crate::models::TransportKind::Http,
        );
        loom.registry.register(agent, false).unwrap();
        assert_eq!(loom.monitor.get_current_metrics().await.agents_total, 1);
    }
}
