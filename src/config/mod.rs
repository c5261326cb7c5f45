use crate::{LoomError, Result};
use serde::{Deserialize, Serialize};

/// Merged configuration for the whole system.
///
/// Values come from an optional config file (`taskloom.toml` or the path in
/// `TASKLOOM_CONFIG`) overlaid with `TASKLOOM_*` environment variables; every
/// field has a working default so an empty environment still starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub data_dir: String,
    pub transport: TransportConfig,
    pub security: SecurityConfig,
    pub orchestrator: OrchestratorConfig,
    pub job: JobConfig,
    pub cache: CacheConfig,
    pub decomposition: DecompositionConfig,
    pub timeouts: TimeoutConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    pub http: HttpConfig,
    pub websocket: WebsocketConfig,
    pub sse: SseConfig,
    pub stdio: StdioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub cors: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8420,
            cors: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8421,
            path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub enabled: bool,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StdioConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Strict,
    Permissive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    pub allowed_directories: Vec<String>,
    pub allow_symlinks: bool,
    /// Empty means any extension is acceptable.
    pub allowed_extensions: Vec<String>,
    /// Admin API key; agent tokens are minted at registration.
    pub api_key: Option<String>,
    pub lock_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::Strict,
            allowed_directories: vec![".".to_string()],
            allow_symlinks: false,
            allowed_extensions: Vec::new(),
            api_key: None,
            lock_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
    CapabilityFirst,
    IntelligentHybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capability: f64,
    pub performance: f64,
    pub availability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.4,
            performance: 0.3,
            availability: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub strategy: SelectionStrategy,
    pub weights: ScoringWeights,
    pub max_tasks_per_agent: usize,
    /// Imbalance detection threshold, in (0, 1].
    pub workload_balance_threshold: f64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::IntelligentHybrid,
            weights: ScoringWeights::default(),
            max_tasks_per_agent: 3,
            workload_balance_threshold: 0.75,
            heartbeat_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub poll_min_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    /// Terminal jobs idle past this are evicted.
    pub retention_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_min_interval_ms: 1000,
            poll_max_interval_ms: 5000,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub chunk_size: usize,
    pub atomic_hour_ceiling: f64,
    /// Inferred dependencies at or above this confidence are applied.
    pub auto_apply_threshold: f64,
    pub max_iterations: usize,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 40,
            atomic_hour_ceiling: 4.0,
            auto_apply_threshold: 0.7,
            max_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub storage_secs: u64,
    pub lock_secs: u64,
    pub llm_secs: u64,
    pub task_execution_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            storage_secs: 5,
            lock_secs: 10,
            llm_secs: 120,
            task_execution_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9700/v1/complete".to_string(),
            api_key: None,
            model: "default".to_string(),
            max_tokens: 4096,
        }
    }
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::Strict
    }
}

impl LoomConfig {
    /// Load the merged configuration: optional file, then environment.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("loaded .env from {:?}", path),
            Err(_) => tracing::debug!("no .env file found"),
        }

        let file = std::env::var("TASKLOOM_CONFIG").unwrap_or_else(|_| "taskloom".to_string());

        let cfg: LoomConfig = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("TASKLOOM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.orchestrator.weights;
        let sum = w.capability + w.performance + w.availability;
        if !(0.99..=1.01).contains(&sum) {
            return Err(LoomError::Validation(format!(
                "orchestrator weights must sum to 1.0 (got {sum:.3})"
            )));
        }
        let t = self.orchestrator.workload_balance_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(LoomError::Validation(
                "workload_balance_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.job.poll_min_interval_ms == 0
            || self.job.poll_min_interval_ms > self.job.poll_max_interval_ms
        {
            return Err(LoomError::Validation(
                "job poll intervals must satisfy 0 < min <= max".to_string(),
            ));
        }
        if self.decomposition.atomic_hour_ceiling <= 0.0 {
            return Err(LoomError::Validation(
                "atomic_hour_ceiling must be positive".to_string(),
            ));
        }
        if self.decomposition.chunk_size == 0 {
            return Err(LoomError::Validation(
                "decomposition chunk_size must be positive".to_string(),
            ));
        }
        if self.orchestrator.max_tasks_per_agent == 0 {
            return Err(LoomError::Validation(
                "max_tasks_per_agent must be positive".to_string(),
            ));
        }
        if let Some(key) = &self.security.api_key {
            if key.len() < 32 {
                return Err(LoomError::Validation(
                    "security api_key must be at least 32 characters".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            data_dir: "./taskloom-data".to_string(),
            transport: TransportConfig::default(),
            security: SecurityConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            job: JobConfig::default(),
            cache: CacheConfig::default(),
            decomposition: DecompositionConfig::default(),
            timeouts: TimeoutConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = LoomConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.orchestrator.strategy, SelectionStrategy::IntelligentHybrid);
        assert_eq!(cfg.job.poll_min_interval_ms, 1000);
        assert_eq!(cfg.job.poll_max_interval_ms, 5000);
        assert_eq!(cfg.decomposition.chunk_size, 40);
        assert!((cfg.decomposition.atomic_hour_ceiling - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bad_weights_rejected() {
        let mut cfg = LoomConfig::default();
        cfg.orchestrator.weights.capability = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_balance_threshold_rejected() {
        let mut cfg = LoomConfig::default();
        cfg.orchestrator.workload_balance_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.orchestrator.workload_balance_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_poll_intervals_rejected() {
        let mut cfg = LoomConfig::default();
        cfg.job.poll_min_interval_ms = 9000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn environment_overrides_defaults() {
        std::env::set_var("TASKLOOM_CONFIG", "taskloom-test-nonexistent");
        std::env::set_var("TASKLOOM_ORCHESTRATOR__MAX_TASKS_PER_AGENT", "7");
        std::env::set_var("TASKLOOM_JOB__POLL_MAX_INTERVAL_MS", "9000");

        let cfg = LoomConfig::load().unwrap();
        assert_eq!(cfg.orchestrator.max_tasks_per_agent, 7);
        assert_eq!(cfg.job.poll_max_interval_ms, 9000);

        std::env::remove_var("TASKLOOM_ORCHESTRATOR__MAX_TASKS_PER_AGENT");
        std::env::remove_var("TASKLOOM_JOB__POLL_MAX_INTERVAL_MS");
        std::env::remove_var("TASKLOOM_CONFIG");
    }

    #[test]
    fn short_api_key_rejected() {
        let mut cfg = LoomConfig::default();
        cfg.security.api_key = Some("short".to_string());
        assert!(cfg.validate().is_err());
        cfg.security.api_key = Some("a".repeat(64));
        assert!(cfg.validate().is_ok());
    }
}
