//! # Caching infrastructure
//!
//! Assets are cached in two tiers, each with its own budget and eviction policy.
//!
//! ## Cache Layers
//!
//! - The [`MemoryTier`] holds decoded objects. It is bounded by a byte budget and evicts by
//!   priority class first, then by recency within a class. An object that could only be admitted
//!   by evicting something more important is not admitted at all.
//! - The [`DiskTier`] holds raw blobs under the configured `cache_dir`. It is bounded by its own
//!   byte budget and evicts in strict least-recently-used order. File-system `mtime` is bumped on
//!   every read, so the order survives restarts.
//!
//! The [`TieredCache`] composes both. A lookup goes through the memory tier first, then the disk
//! tier; a disk hit is decoded and promoted into memory before it is returned. A write goes to
//! memory synchronously, while the disk write happens in the background.
//!
//! If no `cache_dir` is configured, only the memory tier is used.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the memory tier.
//! - `caches.memory.evict`: Entries evicted from the memory tier, tagged by `priority`.
//! - `caches.file.hit` / `caches.file.miss`: Disk tier lookups.
//! - `caches.file.write`: Blobs written to disk, tagged by `status`.
//! - `caches.file.evict`: Blobs trimmed from disk.
//! - `caches.file.size`: The size (in bytes) of blobs read from or written to disk.

mod cache_error;
mod cache_key;
mod cleanup;
mod fs;
mod lru;
mod memory;
mod tiered;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::trim;
pub use fs::{DiskStats, DiskTier};
pub use memory::{MemoryPressure, MemoryStats, MemoryTier};
pub use tiered::{BytesDecoder, Decoder, TieredCache, TieredStats};
