use std::fs::{read_dir, remove_dir};
use std::io;
use std::path::{Component, Path};
use std::time::SystemTime;

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::fs::{DiskEntry, DiskStats, DiskTier, catch_not_found};

/// Entry function for the trim command.
///
/// Opens the disk tier, which rebuilds its index and trims it to the configured budget.
pub fn trim(config: &Config) -> Result<DiskStats> {
    let cache_dir = config.cache_dir.as_ref().ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;

    let disk = DiskTier::open(cache_dir, config.caches.disk_budget)?;
    let stats = disk.stats();
    tracing::info!(
        "Disk cache holds {} files, totaling {} of {} bytes",
        stats.entry_count,
        stats.total_bytes,
        stats.budget_bytes,
    );
    Ok(stats)
}

#[derive(Debug, Default)]
pub(super) struct ScanStats {
    indexed_files: usize,
    indexed_bytes: u64,
    removed_dirs: usize,
    skipped_files: usize,
}

struct ScannedBlob {
    cache_path: String,
    entry: DiskEntry,
}

impl DiskTier {
    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which survive
    /// a hard crash.
    pub(super) fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }

    /// Rebuilds the LRU index from the blobs present on disk.
    ///
    /// Blobs are ordered by their modification time, which is bumped on every read, so the
    /// recency order survives a restart.
    pub(super) fn rebuild_index(&self) -> io::Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut blobs = Vec::new();
        self.scan_directory_recursive(&self.blobs_dir, &mut blobs, &mut stats)?;

        // oldest first, so the freshest blob ends up as the most recently used one
        blobs.sort_by_key(|blob| blob.entry.modified);

        let mut index = self.lock();
        for ScannedBlob { cache_path, entry } in blobs {
            stats.indexed_files += 1;
            stats.indexed_bytes += entry.size;
            index.insert(cache_path, entry);
        }

        tracing::info!(
            "Indexed {} cached files, totaling {} bytes",
            stats.indexed_files,
            stats.indexed_bytes,
        );
        if stats.removed_dirs > 0 || stats.skipped_files > 0 {
            tracing::info!(
                "Removed {} empty directories and skipped {} unknown files",
                stats.removed_dirs,
                stats.skipped_files,
            );
        }

        Ok(stats)
    }

    /// Scans the directory recursively, returning `true` if the directory is empty.
    ///
    /// Empty subdirectories are removed along the way.
    fn scan_directory_recursive(
        &self,
        directory: &Path,
        blobs: &mut Vec<ScannedBlob>,
        stats: &mut ScanStats,
    ) -> io::Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Scanning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.scan_directory_recursive(&path, blobs, stats)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if let Err(e) = remove_dir(&path) {
                        tracing::error!(
                            path = %path.display(),
                            "Failed to clean cache directory: {:?}",
                            e
                        );
                        dir_is_empty = false;
                    } else {
                        stats.removed_dirs += 1;
                    }
                }
                is_empty &= dir_is_empty;
                continue;
            }

            is_empty = false;
            let Some(cache_path) = self.relative_cache_path(&path) else {
                tracing::warn!("Skipping unknown file `{}`", path.display());
                stats.skipped_files += 1;
                continue;
            };
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };

            blobs.push(ScannedBlob {
                cache_path,
                entry: DiskEntry {
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    path,
                },
            });
        }

        Ok(is_empty)
    }

    /// Converts the path of a blob back into the `aa/bbccdd/rest` form of
    /// [`CacheKey::cache_path`](super::CacheKey::cache_path).
    fn relative_cache_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.blobs_dir).ok()?;

        let mut segments = Vec::with_capacity(3);
        for component in relative.components() {
            let Component::Normal(segment) = component else {
                return None;
            };
            segments.push(segment.to_str()?);
        }

        let is_cache_path = segments.len() == 3
            && segments.iter().zip([2, 6, 56]).all(|(segment, len)| {
                segment.len() == len && segment.bytes().all(|b| b.is_ascii_hexdigit())
            });

        is_cache_path.then(|| segments.join("/"))
    }
}
