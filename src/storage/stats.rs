use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Per-operation counters and a moving-average latency.
#[derive(Default)]
pub struct StorageStats {
    creates: AtomicU64,
    reads: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    failures: AtomicU64,
    latency_ewma_us: Mutex<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Read,
    Update,
    Delete,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageStatsSnapshot {
    pub creates: u64,
    pub reads: u64,
    pub updates: u64,
    pub deletes: u64,
    pub lists: u64,
    pub failures: u64,
    pub latency_ewma_us: f64,
}

/// Smoothing factor for the latency average; heavier weight on history.
const EWMA_ALPHA: f64 = 0.2;

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: OpKind, elapsed: Duration) {
        let counter = match op {
            OpKind::Create => &self.creates,
            OpKind::Read => &self.reads,
            OpKind::Update => &self.updates,
            OpKind::Delete => &self.deletes,
            OpKind::List => &self.lists,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let sample = elapsed.as_micros() as f64;
        let mut ewma = self.latency_ewma_us.lock().unwrap_or_else(|e| e.into_inner());
        *ewma = if *ewma == 0.0 {
            sample
        } else {
            *ewma * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
        };
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            latency_ewma_us: *self
                .latency_ewma_us
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }
}
