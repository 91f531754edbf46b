//! Process-wide registry of open caches
//!
//! A directory gets at most one [`AppCache`] per process. The first lookup
//! for a directory opens the cache with the limits it passes; later lookups
//! return that same cache and their limits are ignored.

use crate::cache::AppCache;
use crate::error::Result;
use crate::types::{CacheConfig, DEFAULT_MAX_COUNT, DEFAULT_MAX_SIZE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::debug;

/// Absolute directory and owning process id
type InstanceKey = (PathBuf, u32);

static GLOBAL: LazyLock<CacheRegistry> = LazyLock::new(CacheRegistry::new);

#[derive(Default)]
pub struct CacheRegistry {
    instances: Mutex<HashMap<InstanceKey, Arc<AppCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static CacheRegistry {
        &GLOBAL
    }

    /// Cache for `cache_dir`, opening it with these limits if this is the
    /// first lookup. Fails only if the directory can't be created.
    pub async fn get(
        &self,
        cache_dir: impl AsRef<Path>,
        size_limit: u64,
        count_limit: u64,
    ) -> Result<Arc<AppCache>> {
        let cache_dir = std::path::absolute(cache_dir.as_ref())?;
        let key = (cache_dir, std::process::id());

        let mut instances = self.instances.lock().await;
        if let Some(cache) = instances.get(&key) {
            if cache.size_limit() != size_limit || cache.count_limit() != count_limit {
                debug!(
                    cache_dir = ?key.0,
                    size_limit,
                    count_limit,
                    "Ignoring limits for an already open cache"
                );
            }
            return Ok(cache.clone());
        }

        let cache = Arc::new(AppCache::open(key.0.clone(), size_limit, count_limit).await?);
        instances.insert(key, cache.clone());
        Ok(cache)
    }

    pub async fn get_with_config(&self, config: &CacheConfig) -> Result<Arc<AppCache>> {
        self.get(&config.cache_dir, config.max_size, config.max_count)
            .await
    }

    /// Cache for `cache_dir` with the default limits
    pub async fn get_default(&self, cache_dir: impl AsRef<Path>) -> Result<Arc<AppCache>> {
        self.get(cache_dir, DEFAULT_MAX_SIZE, DEFAULT_MAX_COUNT)
            .await
    }

    /// Number of open caches
    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
