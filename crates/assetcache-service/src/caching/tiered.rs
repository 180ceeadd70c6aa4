use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::types::{Origin, Priority};

use super::{CacheContents, CacheKey, DiskStats, DiskTier, MemoryStats, MemoryTier};

/// Turns raw blobs into in-memory objects.
///
/// Decoding is CPU bound and always runs on the blocking thread pool.
pub trait Decoder: Send + Sync + 'static {
    type Object: Send + Sync + 'static;

    /// Decodes a blob.
    ///
    /// Failures should be reported as [`CacheError::Malformed`](super::CacheError::Malformed).
    fn decode(&self, blob: Bytes) -> CacheContents<Self::Object>;

    /// The "cost" of keeping this object in the memory tier, in bytes.
    fn weight(&self, object: &Self::Object) -> u64;
}

/// A [`Decoder`] that keeps blobs as they are.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Object = Bytes;

    fn decode(&self, blob: Bytes) -> CacheContents<Bytes> {
        Ok(blob)
    }

    fn weight(&self, object: &Bytes) -> u64 {
        object.len() as u64
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TieredStats {
    pub memory: MemoryStats,
    pub disk: Option<DiskStats>,
}

/// The memory and disk tiers combined.
///
/// Lookups go through the memory tier first and fall back to the disk tier, promoting disk hits
/// into memory. Without a disk tier, the cache operates memory-only.
pub struct TieredCache<D: Decoder> {
    memory: Arc<MemoryTier<D::Object>>,
    disk: Option<Arc<DiskTier>>,
    decoder: Arc<D>,
    /// Held for reading by disk lookups and disk writes, and for writing by invalidations, so an
    /// invalidated key can not be resurrected by a lookup or write that was in progress.
    invalidation: Arc<RwLock<()>>,
}

impl<D: Decoder> std::fmt::Debug for TieredCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory", &self.memory.stats())
            .field("disk", &self.disk.as_ref().map(|disk| disk.stats()))
            .finish()
    }
}

impl<D: Decoder> TieredCache<D> {
    pub fn new(memory: MemoryTier<D::Object>, disk: Option<DiskTier>, decoder: D) -> Self {
        Self {
            memory: Arc::new(memory),
            disk: disk.map(Arc::new),
            decoder: Arc::new(decoder),
            invalidation: Default::default(),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryTier<D::Object>> {
        &self.memory
    }

    pub fn disk(&self) -> Option<&Arc<DiskTier>> {
        self.disk.as_ref()
    }

    pub fn decoder(&self) -> &Arc<D> {
        &self.decoder
    }

    /// Looks up an object, promoting disk hits into memory at [`Priority::Normal`].
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<D::Object>> {
        self.lookup(key, Priority::Normal)
            .await
            .map(|(object, _)| object)
    }

    /// Looks up an object, promoting disk hits into memory at the given priority.
    pub async fn lookup(
        &self,
        key: &CacheKey,
        priority: Priority,
    ) -> Option<(Arc<D::Object>, Origin)> {
        metric!(counter("caches.access") += 1);

        if let Some(object) = self.memory.get(key) {
            return Some((object, Origin::Memory));
        }

        self.lookup_disk(key, priority)
            .await
            .map(|object| (object, Origin::Disk))
    }

    /// Looks up an object in the disk tier only, promoting a hit into memory.
    ///
    /// A blob that fails to decode is dropped from the disk tier.
    pub async fn lookup_disk(&self, key: &CacheKey, priority: Priority) -> Option<Arc<D::Object>> {
        let disk = Arc::clone(self.disk.as_ref()?);
        let _guard = self.invalidation.read().await;

        let blob = {
            let key = key.clone();
            tokio::task::spawn_blocking(move || disk.get(&key))
        };
        let blob = match blob.await {
            Ok(blob) => blob?,
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "Disk lookup failed");
                return None;
            }
        };

        let object = match self.decode(blob).await {
            Ok(object) => Arc::new(object),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Dropping undecodable blob for `{}`",
                    key
                );
                if let Some(disk) = self.disk.clone() {
                    let key = key.clone();
                    tokio::task::spawn_blocking(move || disk.remove(&key));
                }
                return None;
            }
        };

        let weight = self.decoder.weight(&object);
        self.memory
            .put(key.clone(), Arc::clone(&object), weight, priority);

        Some(object)
    }

    /// Decodes a blob on the blocking thread pool.
    pub async fn decode(&self, blob: Bytes) -> CacheContents<D::Object> {
        let decoder = Arc::clone(&self.decoder);
        tokio::task::spawn_blocking(move || decoder.decode(blob)).await?
    }

    /// Writes an object to both tiers.
    ///
    /// The memory write happens right away. The disk write is spawned in the background and
    /// not awaited.
    pub async fn put(&self, key: CacheKey, blob: Bytes, object: Arc<D::Object>, priority: Priority) {
        let weight = self.decoder.weight(&object);
        let guard = Arc::clone(&self.invalidation).read_owned().await;
        self.memory.put(key.clone(), object, weight, priority);

        if let Some(disk) = self.disk.clone() {
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                disk.put(&key, &blob);
            });
        }
    }

    /// Removes a key from both tiers.
    ///
    /// Waits for all in-progress disk lookups and writes to finish first.
    pub async fn invalidate(&self, key: &CacheKey) {
        let _guard = self.invalidation.write().await;
        self.memory.remove(key);

        if let Some(disk) = self.disk.clone() {
            let key = key.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || disk.remove(&key)).await {
                tracing::error!(error = &e as &dyn std::error::Error, "Disk removal failed");
            }
        }
        tracing::debug!("Invalidated `{}`", key);
    }

    pub fn stats(&self) -> TieredStats {
        TieredStats {
            memory: self.memory.stats(),
            disk: self.disk.as_ref().map(|disk| disk.stats()),
        }
    }
}
