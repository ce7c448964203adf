//! In-memory cache backend.

use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{CacheBackend, CacheBucket, CacheError, CacheKey, CachedResponse};

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, CacheBucket>,
    next_seq: u64,
}

/// Buckets held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously persisted buckets.
    pub(crate) fn from_buckets(buckets: Vec<CacheBucket>) -> Self {
        let next_seq = buckets.iter().map(|b| b.seq + 1).max().unwrap_or(0);
        let buckets = buckets
            .into_iter()
            .map(|bucket| (bucket.name.clone(), bucket))
            .collect();
        Self {
            state: Arc::new(RwLock::new(State { buckets, next_seq })),
        }
    }

    /// Copy of one bucket, for persistence.
    pub(crate) async fn snapshot(&self, name: &str) -> Option<CacheBucket> {
        self.state.read().await.buckets.get(name).cloned()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn create(&self, name: &str) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        if !state.buckets.contains_key(name) {
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .buckets
                .insert(name.to_string(), CacheBucket::new(name, seq));
        }
        Ok(())
    }

    async fn contains(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.state.read().await.buckets.contains_key(name))
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        let state = self.state.read().await;
        let mut buckets: Vec<&CacheBucket> = state.buckets.values().collect();
        buckets.sort_by_key(|b| b.seq);
        Ok(buckets.into_iter().map(|b| b.name.clone()).collect())
    }

    async fn remove(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.state.write().await.buckets.remove(name).is_some())
    }

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let state = self.state.read().await;
        let bucket = state
            .buckets
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(bucket.entries.get(key).cloned())
    }

    async fn insert_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        let bucket = state
            .buckets
            .get_mut(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        bucket.entries.extend(entries);
        Ok(())
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
        let state = self.state.read().await;
        let bucket = state
            .buckets
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        let mut keys: Vec<CacheKey> = bucket.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
