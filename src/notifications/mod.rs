//! Session-keyed push channel.
//!
//! Best-effort, at-most-once delivery, ordered per session. Send failures
//! never propagate to the caller: serialization errors are logged and
//! dropped, closed sessions are silently unregistered.

use crate::constants::NOTIFICATION_QUEUE_CAPACITY;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One wire frame, already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    /// The SSE text shape: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

struct SessionChannel {
    tx: mpsc::Sender<Frame>,
    opened_at: DateTime<Utc>,
}

pub struct NotificationBus {
    sessions: DashMap<String, SessionChannel>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Open a push channel for `session_id`; the first frame on it is
    /// `connection: established`. Re-registering replaces the old channel.
    pub fn register(&self, session_id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let _ = tx.try_send(Frame {
            event: "connection".to_string(),
            data: "established".to_string(),
        });
        self.sessions.insert(
            session_id.to_string(),
            SessionChannel {
                tx,
                opened_at: Utc::now(),
            },
        );
        debug!(session_id, "notification session registered");
        rx
    }

    pub fn unregister(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(session_id, "notification session unregistered");
        }
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_age(&self, session_id: &str) -> Option<chrono::Duration> {
        self.sessions
            .get(session_id)
            .map(|s| Utc::now() - s.opened_at)
    }

    /// Push one event to one session. Returns whether the frame was queued.
    pub fn send<T: Serialize>(&self, session_id: &str, event: &str, payload: &T) -> bool {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id, event, "dropping unserializable notification: {e}");
                return false;
            }
        };

        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };

        match session.tx.try_send(Frame {
            event: event.to_string(),
            data,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id, event, "notification queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(session);
                self.unregister(session_id);
                false
            }
        }
    }

    /// Fan one event out to every session; per-session failures are isolated.
    pub fn broadcast<T: Serialize>(&self, event: &str, payload: &T) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.send(id, event, payload))
            .count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
