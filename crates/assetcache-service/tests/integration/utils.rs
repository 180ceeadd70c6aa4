use std::sync::Arc;
use std::time::Duration;

use assetcache_service::caching::{DiskTier, MemoryTier, TieredCache};
use assetcache_service::config::{Config, LoaderConfig, PreloadConfig};
use assetcache_service::download::Fetcher;
use assetcache_service::download::batch::NetworkMonitor;
use assetcache_service::loader::PriorityLoader;
use assetcache_service::preload::{MemoryProbe, Preloader};
use assetcache_service::services::Engine;
use assetcache_test as test;

pub use test::{FixedNetwork, FixedProbe, MockFetcher, Server, TestDecoder, wait_until};

/// A loader configuration with short retry delays.
pub fn loader_config() -> LoaderConfig {
    LoaderConfig {
        max_workers: 2,
        initial_retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

/// A preload configuration with a short quiescence window.
pub fn preload_config() -> PreloadConfig {
    PreloadConfig {
        quiescence: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Creates a cache with a 1 MiB memory tier, and a disk tier in `cache_dir` if given.
pub fn tiered_cache(cache_dir: Option<&test::TempDir>) -> Arc<TieredCache<TestDecoder>> {
    let disk = cache_dir.map(|dir| DiskTier::open(dir.path(), 1024 * 1024).unwrap());
    Arc::new(TieredCache::new(
        MemoryTier::new(1024 * 1024),
        disk,
        TestDecoder,
    ))
}

/// Setup tests and create a loader on top of a memory-only cache.
pub fn setup_loader(
    fetcher: Arc<dyn Fetcher>,
    config: LoaderConfig,
) -> PriorityLoader<TestDecoder> {
    test::setup();

    let runtime = tokio::runtime::Handle::current();
    PriorityLoader::new(config, fetcher, tiered_cache(None), &runtime)
}

/// Setup tests and create a preloader whose memory utilization is reported by `probe`.
pub fn setup_preloader(
    fetcher: Arc<MockFetcher>,
    config: PreloadConfig,
    probe: Arc<FixedProbe>,
) -> Preloader<TestDecoder> {
    let loader = setup_loader(fetcher, loader_config());
    let runtime = tokio::runtime::Handle::current();
    Preloader::new(config, loader, probe as Arc<dyn MemoryProbe>, runtime)
}

/// Setup tests and create an engine.
///
/// If `cache_dir` is given, the engine uses a disk tier in that directory. The `update_config`
/// closure can modify the default configuration before the engine is created.
pub fn setup_engine(
    fetcher: Arc<MockFetcher>,
    cache_dir: Option<&test::TempDir>,
    update_config: impl FnOnce(&mut Config),
) -> Engine<TestDecoder> {
    test::setup();

    let mut config = Config {
        cache_dir: cache_dir.map(|dir| dir.path().to_owned()),
        loader: loader_config(),
        preload: preload_config(),
        ..Default::default()
    };
    update_config(&mut config);

    let network = Arc::new(FixedNetwork::unmetered()) as Arc<dyn NetworkMonitor>;
    Engine::new(config, fetcher, TestDecoder, network).unwrap()
}
