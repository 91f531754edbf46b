//! Cache types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TIME_MIN: u64 = 60;
pub const TIME_HOUR: u64 = 60 * TIME_MIN;
pub const TIME_DAY: u64 = 24 * TIME_HOUR;

pub const DEFAULT_MAX_SIZE: u64 = 1000 * 1000 * 50; // 50MB
pub const DEFAULT_MAX_COUNT: u64 = u64::MAX;

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Location and limits of a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Ceiling on the summed byte length of all entry files
    pub max_size: u64,
    /// Ceiling on the number of entry files
    pub max_count: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/app"),
            max_size: DEFAULT_MAX_SIZE,
            max_count: DEFAULT_MAX_COUNT,
        }
    }
}

impl CacheConfig {
    /// Load configuration from `CACHE_DIR`, `MAX_CACHE_SIZE` and `MAX_CACHE_COUNT`,
    /// falling back to the defaults for anything missing or unparseable
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let max_size = lookup("MAX_CACHE_SIZE")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_size);

        let max_count = lookup("MAX_CACHE_COUNT")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_count);

        Self {
            cache_dir,
            max_size,
            max_count,
        }
    }
}
