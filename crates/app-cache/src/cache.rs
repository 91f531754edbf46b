//! Directory-backed byte cache
//!
//! Every entry is one file under the cache directory, named by hashing its
//! key. Values may carry an expiry header (see [`crate::ttl`]). Failures on
//! individual files are logged and degrade to a miss or a no-op.

use crate::accountant::{modified_ms, Accountant};
use crate::codec::{JsonCodec, StringCodec, ValueCodec};
use crate::error::{CacheError, Result};
use crate::path;
use crate::ttl;
use crate::types::CacheStats;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A size- and count-bounded cache of byte values stored in one directory
pub struct AppCache {
    cache_dir: PathBuf,
    accountant: Arc<Accountant>,
    /// Flips to true once the startup scan has seeded the accountant
    scanned: watch::Receiver<bool>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AppCache {
    /// Open a cache on `cache_dir`, creating the directory if needed.
    ///
    /// Existing files are accounted for by a background scan; the cache can
    /// be used right away but its totals are incomplete until
    /// [`wait_until_scanned`](Self::wait_until_scanned) resolves. Must be
    /// called from within a tokio runtime.
    pub async fn open(cache_dir: PathBuf, size_limit: u64, count_limit: u64) -> Result<Self> {
        if let Err(e) = fs::create_dir_all(&cache_dir).await {
            return Err(CacheError::CreateDir(cache_dir, Box::new(e)));
        }

        let accountant = Arc::new(Accountant::new(cache_dir.clone(), size_limit, count_limit));
        let (scanned_tx, scanned) = watch::channel(false);

        let scan_dir = cache_dir.clone();
        let scan_accountant = accountant.clone();
        tokio::spawn(async move {
            if let Err(e) = scan_existing(&scan_dir, &scan_accountant).await {
                warn!(cache_dir = ?scan_dir, error = %e, "Startup scan failed");
            }
            let _ = scanned_tx.send(true);
        });

        info!(cache_dir = ?cache_dir, size_limit, count_limit, "Cache opened");

        Ok(Self {
            cache_dir,
            accountant,
            scanned,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn size_limit(&self) -> u64 {
        self.accountant.size_limit()
    }

    pub fn count_limit(&self) -> u64 {
        self.accountant.count_limit()
    }

    /// Resolves once the startup scan has finished
    pub async fn wait_until_scanned(&self) {
        let mut scanned = self.scanned.clone();
        // Err means the scan task is gone, which also means it's done
        let _ = scanned.wait_for(|done| *done).await;
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        path::entry_path(&self.cache_dir, key)
    }

    /// Store `payload` under `key`, optionally expiring after `ttl_secs`.
    /// Write failures are logged, not returned.
    pub async fn put(&self, key: &str, payload: &[u8], ttl_secs: Option<u64>) {
        let path = self.entry_path(key);
        let data = ttl::encode(payload, ttl_secs);
        let size = data.len() as u64;

        self.accountant.admit(&path, size).await;

        match fs::write(&path, &data).await {
            Ok(()) => debug!(key = %key, size, ttl_secs = ?ttl_secs, "Cached entry"),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write cache entry");
                // Nothing on disk to evict later, so give the slot back
                let written = fs::metadata(&path).await.is_ok_and(|m| m.is_file());
                if !written {
                    self.accountant.forget(&path, size).await;
                    return;
                }
            }
        }

        self.accountant.touch(&path).await;
    }

    /// Read the value for `key`. Expired entries are deleted and read as a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        self.accountant.touch(&path).await;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to read cache entry");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if ttl::is_expired(&data) {
            debug!(key = %key, "Cache entry expired");
            self.remove(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(ttl::into_payload(data))
    }

    /// Whether a live entry exists for `key`. Doesn't refresh recency;
    /// expired entries are deleted.
    pub async fn contains(&self, key: &str) -> bool {
        let path = self.entry_path(key);
        match read_header(&path).await {
            Ok(prefix) if ttl::is_expired(&prefix) => {
                debug!(key = %key, "Cache entry expired");
                self.remove(key).await;
                false
            }
            Ok(_) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(key = %key, error = %e, "Failed to read cache entry header");
                }
                false
            }
        }
    }

    /// Delete the entry for `key`. Returns whether a file was deleted.
    pub async fn remove(&self, key: &str) -> bool {
        let path = self.entry_path(key);
        self.accountant.touch(&path).await;

        let size = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.accountant.forget(&path, size).await;
                debug!(key = %key, size, "Removed cache entry");
                true
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to remove cache entry");
                }
                false
            }
        }
    }

    /// Delete every entry. Stops at the first file that can't be deleted.
    pub async fn clear(&self) {
        match self.accountant.clear().await {
            Ok(()) => info!(cache_dir = ?self.cache_dir, "Cache cleared"),
            Err(e) => warn!(cache_dir = ?self.cache_dir, error = %e, "Cache clear stopped early"),
        }
    }

    /// Path of the entry file for `key` if it currently exists. Doesn't
    /// refresh recency or check expiry.
    pub async fn file_for(&self, key: &str) -> Option<PathBuf> {
        let path = self.entry_path(key);
        match fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.accountant.total_count(),
            total_size: self.accountant.total_size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Encode `value` with `codec` and store it. Encode failures are logged.
    pub async fn put_value<C: ValueCodec>(
        &self,
        key: &str,
        codec: &C,
        value: &C::Value,
        ttl_secs: Option<u64>,
    ) {
        match codec.encode(value) {
            Ok(bytes) => self.put(key, &bytes, ttl_secs).await,
            Err(e) => warn!(key = %key, error = %e, "Failed to encode cache value"),
        }
    }

    /// Read and decode the value for `key`; undecodable bytes read as a miss
    pub async fn get_value<C: ValueCodec>(&self, key: &str, codec: &C) -> Option<C::Value> {
        let bytes = self.get(key).await?;
        let value = codec.decode(&bytes);
        if value.is_none() {
            debug!(key = %key, "Cached bytes did not decode");
        }
        value
    }

    pub async fn put_string(&self, key: &str, value: &str, ttl_secs: Option<u64>) {
        self.put(key, value.as_bytes(), ttl_secs).await;
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.get_value(key, &StringCodec).await
    }

    pub async fn put_json<T: Serialize + DeserializeOwned>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) {
        self.put_value(key, &JsonCodec::<T>::new(), value, ttl_secs)
            .await;
    }

    pub async fn get_json<T: Serialize + DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_value(key, &JsonCodec::<T>::new()).await
    }

    pub async fn put_bool(&self, key: &str, value: bool, ttl_secs: Option<u64>) {
        self.put_json(key, &value, ttl_secs).await;
    }

    /// Missing, expired and malformed entries all read as false
    pub async fn get_bool(&self, key: &str) -> bool {
        self.get_json::<bool>(key).await.unwrap_or(false)
    }
}

/// The first bytes of an entry file, enough to hold any expiry header
async fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let file = fs::File::open(path).await?;
    let mut prefix = Vec::with_capacity(ttl::MAX_HEADER_LEN);
    file.take(ttl::MAX_HEADER_LEN as u64)
        .read_to_end(&mut prefix)
        .await?;
    Ok(prefix)
}

/// Seed the accountant with every file already in the directory
async fn scan_existing(cache_dir: &Path, accountant: &Accountant) -> io::Result<()> {
    let mut files = 0u64;
    let mut bytes = 0u64;

    let mut entries = fs::read_dir(cache_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                debug!(file = ?entry.path(), error = %e, "Skipping unreadable cache file");
                continue;
            }
        };

        let last_used = metadata.modified().map(modified_ms).unwrap_or(0);
        accountant
            .note_scanned(entry.path(), metadata.len(), last_used)
            .await;
        files += 1;
        bytes += metadata.len();
    }

    info!(cache_dir = ?cache_dir, files, bytes, "Startup scan complete");
    Ok(())
}
