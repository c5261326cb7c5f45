use crate::constants::{
    DELIVERY_BACKOFF_BASE_MS, DELIVERY_BACKOFF_MAX_MS, DELIVERY_FALLBACK_BUDGET_MS,
};
use crate::models::{AgentRecord, TaskDescriptor, TransportKind};
use crate::notifications::NotificationBus;
use crate::{LoomError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Routes a task descriptor to an agent over whichever transport it
/// registered with.
///
/// HTTP deliveries retry with exponential backoff and jitter; channel-based
/// transports fail fast when the channel is gone.
pub struct DeliveryRouter {
    http: reqwest::Client,
    ws_senders: DashMap<String, mpsc::Sender<String>>,
    bus: Arc<NotificationBus>,
}

impl DeliveryRouter {
    pub fn new(bus: Arc<NotificationBus>) -> Self {
        Self {
            http: reqwest::Client::new(),
            ws_senders: DashMap::new(),
            bus,
        }
    }

    /// Attach a WebSocket agent's outbound channel; frames are JSON text.
    pub fn register_ws(&self, agent_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        self.ws_senders.insert(agent_id.to_string(), tx);
        rx
    }

    pub fn unregister_ws(&self, agent_id: &str) {
        self.ws_senders.remove(agent_id);
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_senders.len()
    }

    pub async fn deliver(&self, agent: &AgentRecord, descriptor: &TaskDescriptor) -> Result<()> {
        match agent.transport {
            TransportKind::Http => self.deliver_http(agent, descriptor).await,
            TransportKind::Websocket => self.deliver_ws(agent, descriptor).await,
            TransportKind::Stdio | TransportKind::Sse => self.deliver_session(agent, descriptor),
        }
    }

    async fn deliver_http(&self, agent: &AgentRecord, descriptor: &TaskDescriptor) -> Result<()> {
        let endpoint = agent.http_endpoint.as_deref().ok_or_else(|| {
            LoomError::transport(format!("agent {} has no http endpoint", agent.id))
        })?;
        url::Url::parse(endpoint)
            .map_err(|e| LoomError::transport(format!("bad agent endpoint: {e}")))?;

        let body = serde_json::json!({
            "agentId": agent.id,
            "taskId": descriptor.task_id,
            "taskPayload": descriptor.payload,
            "priority": descriptor.priority,
            "deadline": descriptor.deadline,
        });

        // Exponential backoff until the task deadline; a descriptor without
        // one gets the fallback budget.
        let deadline: DateTime<Utc> = descriptor.deadline.unwrap_or_else(|| {
            Utc::now() + ChronoDuration::milliseconds(DELIVERY_FALLBACK_BUDGET_MS as i64)
        });
        let mut backoff_ms = DELIVERY_BACKOFF_BASE_MS;
        let mut attempt: u32 = 0;
        let mut last_err: Option<String>;

        loop {
            attempt += 1;
            let mut request = self.http.post(endpoint).json(&body);
            if let Some(token) = &agent.http_auth_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(agent_id = %agent.id, task_id = %descriptor.task_id, "task delivered over http");
                    return Ok(());
                }
                Ok(resp) => {
                    last_err = Some(format!("agent returned {}", resp.status()));
                    warn!(agent_id = %agent.id, attempt, "delivery rejected: {}", resp.status());
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    warn!(agent_id = %agent.id, attempt, "delivery attempt failed: {e}");
                }
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4);
            let wait_ms = backoff_ms + jitter;
            if Utc::now() + ChronoDuration::milliseconds(wait_ms as i64) >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            backoff_ms = (backoff_ms * 2).min(DELIVERY_BACKOFF_MAX_MS);
        }

        Err(LoomError::transport(format!(
            "http delivery to {} failed after {attempt} attempts: {}",
            agent.id,
            last_err.unwrap_or_else(|| "unknown".to_string())
        )))
    }

    async fn deliver_ws(&self, agent: &AgentRecord, descriptor: &TaskDescriptor) -> Result<()> {
        let frame = serde_json::to_string(&serde_json::json!({
            "type": "task",
            "taskId": descriptor.task_id,
            "taskPayload": descriptor.payload,
            "priority": descriptor.priority,
            "deadline": descriptor.deadline,
        }))?;

        let sender = self.ws_senders.get(&agent.id).ok_or_else(|| {
            LoomError::transport(format!("agent {} has no websocket attached", agent.id))
        })?;

        sender
            .send(frame)
            .await
            .map_err(|_| LoomError::transport(format!("websocket to {} is closed", agent.id)))?;
        debug!(agent_id = %agent.id, task_id = %descriptor.task_id, "task delivered over websocket");
        Ok(())
    }

    /// stdio / SSE agents receive a push frame on their session channel.
    fn deliver_session(&self, agent: &AgentRecord, descriptor: &TaskDescriptor) -> Result<()> {
        let session = agent.session_id.as_deref().ok_or_else(|| {
            LoomError::transport(format!("agent {} has no session channel", agent.id))
        })?;

        if self.bus.send(session, "taskDelivered", descriptor) {
            Ok(())
        } else {
            Err(LoomError::transport(format!(
                "session channel for {} is closed",
                agent.id
            )))
        }
    }

    /// Best-effort cancel frame; errors are logged and swallowed.
    pub async fn send_cancel(&self, agent: &AgentRecord, task_id: &str) {
        let result = match agent.transport {
            TransportKind::Http => {
                if let Some(endpoint) = agent.http_endpoint.as_deref() {
                    let mut request = self
                        .http
                        .post(format!("{}/cancel", endpoint.trim_end_matches('/')))
                        .json(&serde_json::json!({"taskId": task_id}));
                    if let Some(token) = &agent.http_auth_token {
                        request = request.bearer_auth(token);
                    }
                    request.send().await.map(|_| ()).map_err(|e| e.to_string())
                } else {
                    Err("no endpoint".to_string())
                }
            }
            TransportKind::Websocket => match self.ws_senders.get(&agent.id) {
                Some(sender) => sender
                    .try_send(format!("{{\"type\":\"cancel\",\"taskId\":\"{task_id}\"}}"))
                    .map_err(|e| e.to_string()),
                None => Err("no websocket".to_string()),
            },
            TransportKind::Stdio | TransportKind::Sse => {
                match agent.session_id.as_deref() {
                    Some(session) => {
                        self.bus
                            .send(session, "taskCancelled", &serde_json::json!({"taskId": task_id}));
                        Ok(())
                    }
                    None => Err("no session".to_string()),
                }
            }
        };

        if let Err(e) = result {
            debug!(agent_id = %agent.id, task_id, "cancel frame not delivered: {e}");
        }
    }
}
