use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::CacheKey;
use super::lru::LruList;

/// A blob persisted by the [`DiskTier`].
#[derive(Debug)]
pub(super) struct DiskEntry {
    pub(super) path: PathBuf,
    pub(super) size: u64,
    pub(super) modified: SystemTime,
}

#[derive(Debug)]
pub(super) struct DiskIndex {
    pub(super) entries: LruList<String, DiskEntry>,
    pub(super) total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl DiskIndex {
    pub(super) fn insert(&mut self, cache_path: String, entry: DiskEntry) {
        self.total_bytes += entry.size;
        if let Some(previous) = self.entries.insert(cache_path, entry, 0) {
            self.total_bytes -= previous.size;
        }
    }

    fn remove(&mut self, cache_path: &String) -> Option<DiskEntry> {
        let entry = self.entries.remove(cache_path)?;
        self.total_bytes -= entry.size;
        Some(entry)
    }
}

/// A snapshot of the [`DiskTier`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DiskStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, or `0.0` before the first access.
    pub hit_rate: f64,
}

/// A bounded, persistent LRU store of raw blobs.
///
/// Blobs are stored under `<root>/blobs` in a fan-out layout derived from
/// [`CacheKey::cache_path`]. New blobs are written to a temporary file under `<root>/tmp` first
/// and atomically renamed into place, so a crash mid-write never exposes a partial blob.
///
/// Disk faults are logged and never surfaced: a failed read is a miss and a failed write simply
/// does not persist anything.
#[derive(Debug)]
pub struct DiskTier {
    pub(super) blobs_dir: PathBuf,
    pub(super) tmp_dir: PathBuf,
    budget: u64,
    pub(super) index: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Opens the disk tier rooted at `root`, indexing all blobs that already exist.
    ///
    /// Leftover temporary files are removed, and the index is trimmed to `budget` right away.
    pub fn open(root: impl AsRef<Path>, budget: u64) -> io::Result<Self> {
        let root = root.as_ref();
        let blobs_dir = root.join("blobs");
        fs::create_dir_all(&blobs_dir)?;

        let tier = DiskTier {
            blobs_dir,
            tmp_dir: root.join("tmp"),
            budget,
            index: Mutex::new(DiskIndex {
                entries: LruList::new(1),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        };

        tier.clear_tmp()?;
        tier.rebuild_index()?;
        tier.trim_to_budget();

        Ok(tier)
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, DiskIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Reads a blob, marking it as most recently used.
    ///
    /// This does blocking file-system I/O.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let cache_path = key.cache_path();
        let path = {
            let mut index = self.lock();
            match index.entries.peek(&cache_path) {
                Some(entry) => entry.path.clone(),
                None => {
                    index.misses += 1;
                    metric!(counter("caches.file.miss") += 1);
                    return None;
                }
            }
        };

        tracing::trace!("Loading `{}` from {}", key, path.display());
        let data = match catch_not_found(|| fs::read(&path)) {
            Ok(Some(data)) => data,
            Ok(None) => {
                // the file vanished behind our back, forget about it
                let mut index = self.lock();
                index.remove(&cache_path);
                index.misses += 1;
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache file",
                );
                self.lock().misses += 1;
                return None;
            }
        };

        let now = SystemTime::now();
        {
            let mut index = self.lock();
            if let Some(entry) = index.entries.get(&cache_path) {
                entry.modified = now;
            }
            index.hits += 1;
        }
        if let Err(e) = filetime::set_file_mtime(&path, FileTime::from_system_time(now)) {
            tracing::debug!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to touch cache file",
            );
        }

        metric!(counter("caches.file.hit") += 1);
        metric!(histogram("caches.file.size") = data.len() as u64, "hit" => "true");

        Some(Bytes::from(data))
    }

    /// Persists a blob, then trims the tier back to its budget.
    ///
    /// Returns whether the blob is still stored afterwards. A blob larger than the whole budget
    /// is written and immediately trimmed away again.
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> bool {
        let cache_path = key.cache_path();
        let path = self.blobs_dir.join(&cache_path);

        let temp_file = match self.write_tempfile(data) {
            Ok(temp_file) => temp_file,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to write temp file",
                );
                metric!(counter("caches.file.write") += 1, "status" => "error");
                return false;
            }
        };

        // renames and deletions are serialized by the index lock
        let mut index = self.lock();
        if let Err(e) = persist_tempfile(temp_file, &path) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to persist temp file",
            );
            metric!(counter("caches.file.write") += 1, "status" => "error");
            return false;
        }

        tracing::trace!("Stored `{}` at {}", key, path.display());
        metric!(counter("caches.file.write") += 1, "status" => "ok");
        metric!(histogram("caches.file.size") = data.len() as u64, "hit" => "false");

        index.insert(
            cache_path.clone(),
            DiskEntry {
                path,
                size: data.len() as u64,
                modified: SystemTime::now(),
            },
        );
        self.trim_locked(&mut index);

        index.entries.contains(&cache_path)
    }

    /// Removes a blob. Returns whether it was indexed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut index = self.lock();
        match index.remove(&key.cache_path()) {
            Some(entry) => {
                remove_blob(&entry.path);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(&key.cache_path())
    }

    /// The last time the blob was written or read.
    pub fn last_modified(&self, key: &CacheKey) -> Option<SystemTime> {
        self.lock()
            .entries
            .peek(&key.cache_path())
            .map(|entry| entry.modified)
    }

    /// Deletes least recently used blobs until the tier fits its budget.
    ///
    /// Returns the number of removed blobs.
    pub fn trim_to_budget(&self) -> usize {
        self.trim_locked(&mut self.lock())
    }

    fn trim_locked(&self, index: &mut DiskIndex) -> usize {
        let mut removed = 0;
        while index.total_bytes > self.budget {
            let Some((_, entry)) = index.entries.pop_lru(0) else {
                break;
            };
            index.total_bytes -= entry.size;
            index.evictions += 1;
            removed += 1;
            // the index entry is gone even if the file lingers
            remove_blob(&entry.path);
        }

        if removed > 0 {
            tracing::debug!(
                "Trimmed {} blobs, {} of {} bytes in use",
                removed,
                index.total_bytes,
                self.budget
            );
            metric!(counter("caches.file.evict") += removed as i64);
        }
        removed
    }

    /// Removes every blob.
    pub fn clear(&self) {
        let mut index = self.lock();
        while let Some((_, entry)) = index.entries.pop_lru(0) {
            remove_blob(&entry.path);
        }
        index.total_bytes = 0;
    }

    pub fn stats(&self) -> DiskStats {
        let index = self.lock();
        let accesses = index.hits + index.misses;
        DiskStats {
            entry_count: index.entries.len(),
            total_bytes: index.total_bytes,
            budget_bytes: self.budget,
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
            hit_rate: if accesses == 0 {
                0.0
            } else {
                index.hits as f64 / accesses as f64
            },
        }
    }

    fn write_tempfile(&self, data: &[u8]) -> io::Result<NamedTempFile> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(data)?;
        temp_file.flush()?;
        Ok(temp_file)
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // the temp directory may be removed underneath us
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    path = %self.tmp_dir.display(),
                    "Failed to create cache directory: {:?}",
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        path = %self.tmp_dir.display(),
                        "Failed to create cache file: {:?}",
                        e
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                path = %parent.display(),
                "Failed to create cache directory: {:?}",
                e
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    path = %cache_path.display(),
                    "Failed to create cache file: {:?}",
                    err
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Deletes a blob file, logging failures.
fn remove_blob(path: &Path) {
    if let Err(e) = catch_not_found(|| fs::remove_file(path)) {
        tracing::error!(
            error = &e as &dyn std::error::Error,
            path = %path.display(),
            "Failed to remove cache file",
        );
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
