//! Disk-backed byte cache with TTL expiry and LRU eviction
//!
//! Stores binary values as one file per key in a cache directory, bounded by
//! total byte size and entry count. Least-recently-used entries are evicted
//! to make room, and entries written with a TTL carry an expiry header that
//! is checked on read.
//!
//! Open caches through [`CacheRegistry`] so a directory is managed by a
//! single [`AppCache`] per process.

pub mod accountant;
pub mod cache;
pub mod codec;
pub mod error;
pub mod path;
pub mod registry;
pub mod ttl;
mod types;

pub use cache::AppCache;
pub use codec::{JsonCodec, StringCodec, ValueCodec};
pub use error::{CacheError, Result};
pub use registry::CacheRegistry;
pub use types::{
    CacheConfig, CacheStats, DEFAULT_MAX_COUNT, DEFAULT_MAX_SIZE, TIME_DAY, TIME_HOUR, TIME_MIN,
};
