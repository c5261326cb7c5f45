use crate::config::LlmConfig;
use crate::{LoomError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Opaque text-completion service.
///
/// The decomposition engine depends only on this trait; prompt content and
/// provider details stay on the other side of the seam.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// HTTP-backed completion client.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    config: LlmConfig,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(config: LlmConfig, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| LoomError::Timeout {
                message: "completion call exceeded its budget".to_string(),
            })??;

        if !response.status().is_success() {
            return Err(LoomError::transport(format!(
                "completion endpoint returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload
            .get("completion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                LoomError::Validation("completion response missing `completion` field".to_string())
            })?;
        debug!(chars = text.len(), "completion received");
        Ok(text.to_string())
    }
}

/// Test double that replays scripted replies in order.
pub struct ScriptedCompletionClient {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
}

impl ScriptedCompletionClient {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into_iter().collect()),
        }
    }

    pub fn with_reply(reply: &str) -> Self {
        Self::new(vec![Ok(reply.to_string())])
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Err(LoomError::Timeout {
                    message: "scripted client exhausted".to_string(),
                })
            })
    }
}
