//! Provides the [`Engine`], the single handle a host needs to create.
//!
//! The [`Engine`] initializes the cache tiers, the loader with its worker pool, the preloader and
//! the batch downloader according to the provided [`Config`]. Hosts create it once and pass it
//! around by reference; separate engines share no state.
//!
//! Workers and background tasks run on the tokio runtime the engine is created in.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::caching::{CacheKey, Decoder, DiskTier, MemoryPressure, MemoryTier, TieredCache, TieredStats};
use crate::config::Config;
use crate::download::Fetcher;
use crate::download::batch::{BatchDownloader, BatchHandle, BatchItem, NetworkMonitor};
use crate::loader::{LoadFuture, LoaderStats, PriorityLoader};
use crate::preload::{MemoryProbe, PreloadRejection, PreloadStats, Preloader};
use crate::types::Priority;

/// The aggregate statistics of every component.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct EngineStats {
    pub cache: TieredStats,
    pub loader: LoaderStats,
    pub preload: PreloadStats,
}

pub struct Engine<D: Decoder> {
    config: Config,
    cache: Arc<TieredCache<D>>,
    loader: PriorityLoader<D>,
    preloader: Preloader<D>,
    batches: BatchDownloader<D>,
}

impl<D: Decoder> std::fmt::Debug for Engine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.cache)
            .field("loader", &self.loader)
            .field("preloader", &self.preloader)
            .field("batches", &self.batches)
            .finish()
    }
}

impl<D: Decoder> Engine<D> {
    /// Builds all components from `config`.
    ///
    /// Must be called from within a tokio runtime. Without a configured `cache_dir`, or if the
    /// disk cache cannot be opened, the engine operates memory-only.
    pub fn new(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        decoder: D,
        network: Arc<dyn NetworkMonitor>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the engine must be created within a tokio runtime")?;

        let disk = match config.cache_dir {
            Some(ref cache_dir) => match DiskTier::open(cache_dir, config.caches.disk_budget) {
                Ok(disk) => Some(disk),
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "Failed to open disk cache at {}, operating memory-only",
                        cache_dir.display()
                    );
                    None
                }
            },
            None => {
                tracing::info!("No cache directory configured, operating memory-only");
                None
            }
        };
        let memory = MemoryTier::new(config.caches.memory_budget);
        let cache = Arc::new(TieredCache::new(memory, disk, decoder));

        let loader = PriorityLoader::new(config.loader, fetcher, Arc::clone(&cache), &runtime);
        let preloader = Preloader::new(
            config.preload,
            loader.clone(),
            Arc::clone(cache.memory()) as Arc<dyn MemoryProbe>,
            runtime.clone(),
        );
        let batches = BatchDownloader::new(config.download, loader.clone(), network, runtime);

        Ok(Self {
            config,
            cache,
            loader,
            preloader,
            batches,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache<D>> {
        &self.cache
    }

    pub fn loader(&self) -> &PriorityLoader<D> {
        &self.loader
    }

    pub fn preloader(&self) -> &Preloader<D> {
        &self.preloader
    }

    pub fn batches(&self) -> &BatchDownloader<D> {
        &self.batches
    }

    /// Looks up a cached object without fetching it.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<D::Object>> {
        self.cache.get(key).await
    }

    /// Loads an object, fetching it on a cache miss.
    pub fn load(&self, key: CacheKey, url: &str, priority: Priority) -> LoadFuture<D::Object> {
        self.loader.load(key, url, priority)
    }

    /// Schedules a speculative load.
    pub fn preload(
        &self,
        key: CacheKey,
        url: &str,
        priority: Priority,
    ) -> Result<(), PreloadRejection> {
        self.preloader.schedule(key, url, priority)
    }

    /// Downloads a batch with the configured strategy.
    pub fn download(&self, items: Vec<BatchItem>) -> BatchHandle {
        self.batches.download(items)
    }

    /// Drops `key` from both tiers, forgets its last outcome and cancels its preload.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.preloader.cancel(key);
        self.loader.reset(key);
        self.cache.invalidate(key).await;
    }

    /// Responds to memory pressure signalled by the host.
    pub fn trim_memory(&self, pressure: MemoryPressure) {
        self.cache.memory().trim(pressure);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            loader: self.loader.stats(),
            preload: self.preloader.stats(),
        }
    }

    /// Cancels all preloads and stops the loader.
    ///
    /// Pending loads fail with [`CacheError::Cancelled`](crate::caching::CacheError::Cancelled).
    pub fn shutdown(&self) {
        self.preloader.disable();
        self.loader.shutdown();
        tracing::info!("Engine shut down");
    }
}
