//! Size, count and recency bookkeeping for a cache directory
//!
//! The accountant tracks the summed byte length and number of entry files
//! plus the last time each file was used, and evicts least-recently-used
//! files to keep a new entry within the size and count ceilings.
//!
//! Totals are best effort. They are seeded by the startup scan while the
//! cache is already in use, so they can drift from what is on disk until
//! the scan has finished.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Last-use stamp. `seq` orders touches that land on the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LastUsed {
    at_ms: i64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Recency {
    files: HashMap<PathBuf, LastUsed>,
    next_seq: u64,
}

impl Recency {
    fn stamp(&mut self, at_ms: i64) -> LastUsed {
        let seq = self.next_seq;
        self.next_seq += 1;
        LastUsed { at_ms, seq }
    }

    fn least_recently_used(&self) -> Option<PathBuf> {
        self.files
            .iter()
            .min_by_key(|(_, used)| **used)
            .map(|(path, _)| path.clone())
    }
}

pub struct Accountant {
    cache_dir: PathBuf,
    size_limit: u64,
    count_limit: u64,
    total_size: AtomicU64,
    total_count: AtomicU64,
    recency: Mutex<Recency>,
}

fn saturating_sub(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(amount))
    });
}

/// Set a file's modification time without touching its contents
async fn set_modified(path: &Path, at: SystemTime) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(at)
    })
    .await
    .map_err(io::Error::other)?
}

impl Accountant {
    pub fn new(cache_dir: PathBuf, size_limit: u64, count_limit: u64) -> Self {
        Self {
            cache_dir,
            size_limit,
            count_limit,
            total_size: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
            recency: Mutex::new(Recency::default()),
        }
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn count_limit(&self) -> u64 {
        self.count_limit
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Number of files with a known last-use time
    pub async fn tracked(&self) -> usize {
        self.recency.lock().await.files.len()
    }

    /// Record a file found by the startup scan. A file already touched by a
    /// live operation keeps its fresher stamp.
    pub async fn note_scanned(&self, file: PathBuf, size: u64, last_used_ms: i64) {
        let mut recency = self.recency.lock().await;
        if !recency.files.contains_key(&file) {
            let stamp = recency.stamp(last_used_ms);
            recency.files.insert(file, stamp);
        }
        self.total_size.fetch_add(size, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Make room for a new entry of `size` bytes about to be written to `file`,
    /// then count it. An entry larger than the whole size budget is admitted
    /// anyway once nothing is left to evict.
    pub async fn admit(&self, file: &Path, size: u64) {
        let mut recency = self.recency.lock().await;

        while self.total_count() >= self.count_limit {
            if self.evict_next(&mut recency).await.is_none() {
                debug!(file = ?file, count = self.total_count(), "Count limit exceeded with nothing to evict");
                break;
            }
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);

        while self.total_size().saturating_add(size) > self.size_limit {
            if self.evict_next(&mut recency).await.is_none() {
                debug!(file = ?file, size, total_size = self.total_size(), "Size limit exceeded with nothing to evict");
                break;
            }
        }
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Mark `file` as used now. Also stamps the file's mtime so a later
    /// startup scan sees the same order. Returns false (and records nothing)
    /// when the file can't be stamped, e.g. because it doesn't exist.
    pub async fn touch(&self, file: &Path) -> bool {
        let now = Utc::now();
        if let Err(e) = set_modified(file, now.into()).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(file = ?file, error = %e, "Failed to stamp last use");
            }
            return false;
        }

        // The lock only covers the insert. An eviction that deleted the file
        // after the stamp leaves a stale path, which the next eviction drops
        // as NotFound.
        let mut recency = self.recency.lock().await;
        let stamp = recency.stamp(now.timestamp_millis());
        recency.files.insert(file.to_path_buf(), stamp);
        true
    }

    /// Stop tracking a file that was removed outside of eviction
    pub async fn forget(&self, file: &Path, size: u64) {
        self.recency.lock().await.files.remove(file);
        saturating_sub(&self.total_size, size);
        saturating_sub(&self.total_count, 1);
    }

    /// Delete the least recently used file. Returns the bytes freed, 0 when
    /// nothing is tracked.
    pub async fn evict_least_recently_used(&self) -> u64 {
        let mut recency = self.recency.lock().await;
        self.evict_next(&mut recency).await.unwrap_or(0)
    }

    async fn evict_next(&self, recency: &mut Recency) -> Option<u64> {
        let file = recency.least_recently_used()?;
        recency.files.remove(&file);

        // A file that is already gone was removed and accounted for by a
        // racing remove or eviction; it frees nothing here
        let size = match fs::metadata(&file).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Some(0),
            Err(_) => 0,
        };
        match fs::remove_file(&file).await {
            Ok(()) => debug!(file = ?file, size, "Evicted least recently used entry"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Some(0),
            Err(e) => warn!(file = ?file, error = %e, "Failed to delete evicted entry"),
        }

        saturating_sub(&self.total_size, size);
        saturating_sub(&self.total_count, 1);
        Some(size)
    }

    /// Drop all bookkeeping and delete every file in the cache directory.
    /// Stops at the first file that can't be deleted.
    pub async fn clear(&self) -> io::Result<()> {
        let mut recency = self.recency.lock().await;
        recency.files.clear();
        self.total_size.store(0, Ordering::Relaxed);
        self.total_count.store(0, Ordering::Relaxed);

        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_file(entry.path()).await?;
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch for a file's modification time
pub fn modified_ms(modified: SystemTime) -> i64 {
    DateTime::<Utc>::from(modified).timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; len]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_admit_counts_new_entry() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 100, 10);

        let file = dir.path().join("a");
        accountant.admit(&file, 40).await;

        assert_eq!(accountant.total_size(), 40);
        assert_eq!(accountant.total_count(), 1);
    }

    #[tokio::test]
    async fn test_touch_missing_file_is_not_tracked() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 100, 10);

        assert!(!accountant.touch(&dir.path().join("missing")).await);
        assert_eq!(accountant.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_evict_empty_frees_nothing() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 100, 10);
        assert_eq!(accountant.evict_least_recently_used().await, 0);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_touched() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        let a = write_file(dir.path(), "a", 10).await;
        let b = write_file(dir.path(), "b", 20).await;
        let c = write_file(dir.path(), "c", 30).await;
        for file in [&a, &b, &c] {
            let size = fs::metadata(file).await.unwrap().len();
            accountant.admit(file, size).await;
            assert!(accountant.touch(file).await);
        }

        // Refresh a so b becomes the oldest
        assert!(accountant.touch(&a).await);

        assert_eq!(accountant.evict_least_recently_used().await, 20);
        assert!(!b.exists());
        assert!(a.exists());
        assert!(c.exists());
        assert_eq!(accountant.total_size(), 40);
        assert_eq!(accountant.total_count(), 2);
        assert_eq!(accountant.tracked().await, 2);
    }

    #[tokio::test]
    async fn test_count_limit_evicts_before_admitting() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 2);

        let a = write_file(dir.path(), "a", 5).await;
        let b = write_file(dir.path(), "b", 5).await;
        for file in [&a, &b] {
            accountant.admit(file, 5).await;
            accountant.touch(file).await;
        }

        let c = dir.path().join("c");
        accountant.admit(&c, 5).await;

        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(accountant.total_count(), 2);
        assert_eq!(accountant.total_size(), 10);
    }

    #[tokio::test]
    async fn test_size_limit_evicts_until_fit() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 25, 100);

        let a = write_file(dir.path(), "a", 10).await;
        let b = write_file(dir.path(), "b", 10).await;
        for file in [&a, &b] {
            accountant.admit(file, 10).await;
            accountant.touch(file).await;
        }

        accountant.admit(&dir.path().join("c"), 10).await;

        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(accountant.total_size(), 20);
        assert_eq!(accountant.total_count(), 2);
    }

    #[tokio::test]
    async fn test_oversized_entry_admitted_after_evicting_everything() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 25, 100);

        let a = write_file(dir.path(), "a", 10).await;
        accountant.admit(&a, 10).await;
        accountant.touch(&a).await;

        accountant.admit(&dir.path().join("big"), 100).await;

        assert!(!a.exists());
        assert_eq!(accountant.total_size(), 100);
        assert_eq!(accountant.total_count(), 1);
    }

    #[tokio::test]
    async fn test_note_scanned_keeps_fresher_stamp() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        let old = write_file(dir.path(), "old", 3).await;
        let fresh = write_file(dir.path(), "fresh", 4).await;

        // fresh is touched by a live operation before the scan reaches it
        accountant.touch(&fresh).await;
        accountant.note_scanned(fresh.clone(), 4, 0).await;
        accountant.note_scanned(old.clone(), 3, 1).await;

        assert_eq!(accountant.total_size(), 7);
        assert_eq!(accountant.total_count(), 2);
        assert_eq!(accountant.evict_least_recently_used().await, 3);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_equal_timestamps_evict_in_touch_order() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        let first = write_file(dir.path(), "first", 1).await;
        let second = write_file(dir.path(), "second", 2).await;
        accountant.note_scanned(first.clone(), 1, 500).await;
        accountant.note_scanned(second.clone(), 2, 500).await;

        assert_eq!(accountant.evict_least_recently_used().await, 1);
        assert!(!first.exists());
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_forget_saturates_at_zero() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        accountant.forget(&dir.path().join("never-counted"), 50).await;
        assert_eq!(accountant.total_size(), 0);
        assert_eq!(accountant.total_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_resets_and_deletes() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        for name in ["a", "b", "c"] {
            let file = write_file(dir.path(), name, 8).await;
            accountant.admit(&file, 8).await;
            accountant.touch(&file).await;
        }

        accountant.clear().await.unwrap();

        assert_eq!(accountant.total_size(), 0);
        assert_eq!(accountant.total_count(), 0);
        assert_eq!(accountant.tracked().await, 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_clear_stops_at_undeletable_entry() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        let file = write_file(dir.path(), "a", 8).await;
        accountant.admit(&file, 8).await;
        accountant.touch(&file).await;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).await.unwrap();

        assert!(accountant.clear().await.is_err());

        assert_eq!(accountant.total_size(), 0);
        assert_eq!(accountant.total_count(), 0);
        assert_eq!(accountant.tracked().await, 0);
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_undeletable_victim_is_dropped() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1);

        let stuck = dir.path().join("stuck");
        fs::create_dir(&stuck).await.unwrap();
        accountant.note_scanned(stuck.clone(), 0, 0).await;

        accountant.admit(&dir.path().join("next"), 5).await;

        assert!(stuck.is_dir());
        assert_eq!(accountant.tracked().await, 0);
        assert_eq!(accountant.total_count(), 1);
        assert_eq!(accountant.total_size(), 5);
    }

    #[tokio::test]
    async fn test_vanished_victim_frees_nothing() {
        let dir = tempdir().unwrap();
        let accountant = Accountant::new(dir.path().to_path_buf(), 1000, 1000);

        let gone = write_file(dir.path(), "gone", 6).await;
        let kept = write_file(dir.path(), "kept", 4).await;
        for file in [&gone, &kept] {
            accountant.admit(file, fs::metadata(file).await.unwrap().len()).await;
            accountant.touch(file).await;
        }

        // Deleted and accounted for elsewhere while still in the recency map
        fs::remove_file(&gone).await.unwrap();
        saturating_sub(&accountant.total_size, 6);
        saturating_sub(&accountant.total_count, 1);

        assert_eq!(accountant.evict_least_recently_used().await, 0);
        assert_eq!(accountant.total_size(), 4);
        assert_eq!(accountant.total_count(), 1);
        assert_eq!(accountant.tracked().await, 1);
        assert!(kept.exists());
    }

    #[test]
    fn test_modified_ms() {
        let at = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_234);
        assert_eq!(modified_ms(at), 1_234);
    }
}
