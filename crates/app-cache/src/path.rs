//! Mapping from cache keys to entry files

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// File name used for a key (hex-encoded SHA-256 of the key)
pub fn file_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Path of the entry file for `key`, directly under `cache_dir`
pub fn entry_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(file_name(key))
}
