use crate::constants::LOCK_POLL_INTERVAL_MS;
use crate::{LoomError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct LockEntry {
    owner: String,
    count: u32,
    epoch: u64,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockEntry {
    fn expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// Resource locks keyed by `"{kind}:{id}"`.
///
/// Locks are reentrant per owner, time-bounded, and recoverable: an entry
/// whose holder never released it is reclaimed by the next acquirer once its
/// TTL has passed.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<DashMap<String, LockEntry>>,
    ttl: Duration,
    epoch: Arc<std::sync::atomic::AtomicU64>,
}

/// RAII guard; dropping releases one level of the (possibly reentrant) hold.
#[derive(Debug)]
pub struct LockHandle {
    table: Arc<DashMap<String, LockEntry>>,
    resource: String,
    owner: String,
    epoch: u64,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(mut entry) = self.table.get_mut(&self.resource) {
            if entry.owner == self.owner && entry.epoch == self.epoch {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    drop(entry);
                    self.table
                        .remove_if(&self.resource, |_, e| e.count == 0 && e.epoch == self.epoch);
                }
            }
        }
    }
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            ttl,
            epoch: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    /// Acquire `resource` for `owner`, waiting up to `timeout`.
    ///
    /// Returns `conflict{holder}` when the wait budget runs out.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;

        loop {
            let attempt = self.try_acquire(resource, owner);
            match attempt {
                Ok(handle) => return Ok(handle),
                Err(holder) => {
                    if Instant::now() >= deadline {
                        debug!(resource, holder = %holder, "lock acquisition timed out");
                        return Err(LoomError::Conflict {
                            resource: resource.to_string(),
                            holder,
                        });
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_INTERVAL_MS)).await;
        }
    }

    /// Single non-blocking attempt; Err carries the current holder.
    pub fn try_acquire(&self, resource: &str, owner: &str) -> std::result::Result<LockHandle, String> {
        use dashmap::mapref::entry::Entry;

        let mut granted_epoch = None;
        match self.table.entry(resource.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.owner == owner {
                    entry.count += 1;
                    granted_epoch = Some(entry.epoch);
                } else if entry.expired() {
                    warn!(
                        resource,
                        stale_owner = %entry.owner,
                        "reclaiming expired lock"
                    );
                    let epoch = self.next_epoch();
                    *entry = LockEntry {
                        owner: owner.to_string(),
                        count: 1,
                        epoch,
                        acquired_at: Instant::now(),
                        ttl: self.ttl,
                    };
                    granted_epoch = Some(epoch);
                } else {
                    return Err(entry.owner.clone());
                }
            }
            Entry::Vacant(vacant) => {
                let epoch = self.next_epoch();
                vacant.insert(LockEntry {
                    owner: owner.to_string(),
                    count: 1,
                    epoch,
                    acquired_at: Instant::now(),
                    ttl: self.ttl,
                });
                granted_epoch = Some(epoch);
            }
        }

        Ok(LockHandle {
            table: Arc::clone(&self.table),
            resource: resource.to_string(),
            owner: owner.to_string(),
            epoch: granted_epoch.expect("granted lock must have an epoch"),
        })
    }

    pub fn holder(&self, resource: &str) -> Option<String> {
        self.table.get(resource).map(|e| e.owner.clone())
    }

    pub fn held_count(&self) -> usize {
        self.table.len()
    }

    fn next_epoch(&self) -> u64 {
        self.epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}
