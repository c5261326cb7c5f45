use super::EntityKind;
use crate::constants::STORAGE_EVENT_CAPACITY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOp {
    Created,
    Updated,
    Deleted,
}

/// Emitted exactly once per committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEvent {
    pub entity: EntityKind,
    pub op: StorageOp,
    pub id: String,
    pub value: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Fan-out of storage events to any number of subscribers.
///
/// Emission is synchronous with the write path; subscribers must drain
/// quickly and never block.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<StorageEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, entity: EntityKind, op: StorageOp, id: &str, value: Option<serde_json::Value>) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(StorageEvent {
            entity,
            op,
            id: id.to_string(),
            value,
            at: Utc::now(),
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
