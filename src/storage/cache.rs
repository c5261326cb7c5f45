use crate::config::CacheConfig;
use std::time::Duration;

/// Optional bounded LRU with TTL in front of one entity kind.
///
/// Writers replace the cached entry with the just-persisted value rather than
/// invalidating, so a read immediately after a write never misses.
#[derive(Clone)]
pub struct EntityCache<T: Clone + Send + Sync + 'static> {
    inner: Option<moka::sync::Cache<String, T>>,
}

impl<T: Clone + Send + Sync + 'static> EntityCache<T> {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            moka::sync::Cache::builder()
                .max_capacity(config.max_size)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build()
        });
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.as_ref()?.get(id)
    }

    pub fn insert(&self, id: &str, value: T) {
        if let Some(cache) = &self.inner {
            cache.insert(id.to_string(), value);
        }
    }

    pub fn invalidate(&self, id: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(id);
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.as_ref().map_or(0, |c| c.entry_count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
