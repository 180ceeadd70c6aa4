use std::sync::Arc;
use std::time::Duration;

use assetcache_service::caching::{CacheError, CacheKey};
use assetcache_service::config::LoaderConfig;
use assetcache_service::loader::LoadState;
use assetcache_service::types::{Origin, Priority};
use futures::future::join_all;

use crate::{MockFetcher, loader_config, setup_loader, tiered_cache, wait_until};

const URL: &str = "https://cdn.example.com/images/a.jpg";

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    fetcher.hold();
    let handles: Vec<_> = (0..10)
        .map(|_| loader.load(key.clone(), URL, Priority::Normal))
        .collect();
    fetcher.wait_for_fetches(URL, 1).await;
    assert_eq!(loader.state().listener_count(&key), 10);
    fetcher.release();

    let results = join_all(handles).await;
    let first = results[0].as_ref().unwrap();
    for result in &results {
        let loaded = result.as_ref().unwrap();
        assert_eq!(loaded.origin, Origin::Network);
        assert!(Arc::ptr_eq(&loaded.object, &first.object));
    }
    assert_eq!(first.object.as_str(), "image-a");
    assert_eq!(fetcher.fetches(URL), 1);

    let stats = loader.stats();
    assert_eq!(stats.requests, 10);
    assert_eq!(stats.dedup_hits, 9);
    assert_eq!(stats.successes, 1);
    assert_eq!(loader.load_state(&key), LoadState::Success);

    // once loaded, the object is served from memory
    let loaded = loader.load(key, URL, Priority::Normal).await.unwrap();
    assert_eq!(loaded.origin, Origin::Memory);
    assert_eq!(fetcher.fetches(URL), 1);
}

#[tokio::test]
async fn test_reports_loading_progress() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    fetcher.hold();
    let handle = loader.load(key.clone(), URL, Priority::High);
    assert!(handle.is_pending());
    fetcher.wait_for_fetches(URL, 1).await;
    assert_eq!(
        loader.load_state(&key),
        LoadState::Loading { progress: None }
    );
    assert_eq!(loader.stats().in_flight, 1);

    fetcher.release();
    handle.await.unwrap();
    assert_eq!(loader.load_state(&key), LoadState::Success);
    assert_eq!(loader.stats().in_flight, 0);
}

#[tokio::test]
async fn test_retries_transient_failures() {
    let fetcher = Arc::new(MockFetcher::new().with_responses(
        URL,
        [
            Err(CacheError::Network("connection reset".into())),
            Err(CacheError::Timeout(Duration::from_secs(1))),
            Ok("image-a".into()),
        ],
    ));
    let loader = setup_loader(fetcher.clone(), loader_config());

    let loaded = loader
        .load(CacheKey::new(URL), URL, Priority::Normal)
        .await
        .unwrap();

    assert_eq!(loaded.object.as_str(), "image-a");
    assert_eq!(fetcher.fetches(URL), 3);
    let stats = loader.stats();
    assert_eq!(stats.fetches, 3);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.successes, 1);
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let fetcher = Arc::new(
        MockFetcher::new().with_error(URL, CacheError::Network("service unavailable".into())),
    );
    let config = LoaderConfig {
        max_retries: 2,
        ..loader_config()
    };
    let loader = setup_loader(fetcher.clone(), config);
    let key = CacheKey::new(URL);

    let result = loader.load(key.clone(), URL, Priority::Normal).await;

    assert_eq!(
        result.unwrap_err(),
        CacheError::Network("service unavailable".into())
    );
    assert_eq!(fetcher.fetches(URL), 3);
    assert_eq!(loader.stats().failures, 1);
    assert!(matches!(
        loader.load_state(&key),
        LoadState::Error(CacheError::Network(_))
    ));
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let fetcher = Arc::new(MockFetcher::new());
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    let result = loader.load(key.clone(), URL, Priority::Normal).await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert_eq!(fetcher.started().len(), 1);

    // a late request observes the stored error without fetching again
    let handle = loader.load(key.clone(), URL, Priority::Normal);
    assert!(!handle.is_pending());
    assert_eq!(handle.await.unwrap_err(), CacheError::NotFound);
    assert_eq!(fetcher.started().len(), 1);

    // an explicit retry starts over
    let result = loader.retry(key, URL, Priority::Normal).await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert_eq!(fetcher.started().len(), 2);
}

#[tokio::test]
async fn test_failures_are_fetched_again_after_error_ttl() {
    let fetcher = Arc::new(MockFetcher::new().with_responses(
        URL,
        [
            Err(CacheError::Network("connection reset".into())),
            Err(CacheError::Network("connection reset".into())),
            Ok("image-a".into()),
        ],
    ));
    let config = LoaderConfig {
        max_retries: 1,
        error_ttl: Duration::from_millis(50),
        ..loader_config()
    };
    let loader = setup_loader(fetcher.clone(), config);
    let key = CacheKey::new(URL);

    let result = loader.load(key.clone(), URL, Priority::Normal).await;
    assert!(matches!(result, Err(CacheError::Network(_))));
    assert_eq!(fetcher.fetches(URL), 2);

    // within the error lifetime, the failure is reported without fetching
    let result = loader.load(key.clone(), URL, Priority::Normal).await;
    assert!(matches!(result, Err(CacheError::Network(_))));
    assert_eq!(fetcher.fetches(URL), 2);

    wait_until(|| loader.load_state(&key) == LoadState::Idle).await;
    assert_eq!(loader.state().record_count(), 0);

    let loaded = loader.load(key, URL, Priority::Normal).await.unwrap();
    assert_eq!(loaded.origin, Origin::Network);
    assert_eq!(fetcher.fetches(URL), 3);
}

#[tokio::test]
async fn test_successful_loads_are_not_tracked() {
    let urls: Vec<_> = (0..50).map(|i| format!("https://cdn.example.com/{i}.jpg")).collect();
    let fetcher = urls
        .iter()
        .fold(MockFetcher::new(), |fetcher, url| fetcher.with_blob(url, "image"));
    let fetcher = Arc::new(fetcher);
    let loader = setup_loader(fetcher.clone(), loader_config());

    let handles: Vec<_> = urls
        .iter()
        .map(|url| loader.load(CacheKey::new(url), url, Priority::Normal))
        .collect();
    for result in join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(loader.stats().successes, 50);
    assert_eq!(loader.state().record_count(), 0);
    assert_eq!(loader.load_state(&CacheKey::new(&urls[0])), LoadState::Success);
}

#[tokio::test]
async fn test_malformed_blob() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "malformed jpeg"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    let result = loader.load(key.clone(), URL, Priority::Normal).await;

    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert_eq!(fetcher.fetches(URL), 1);
    assert!(!loader.cache().memory().contains(&key));
}

#[tokio::test]
async fn test_reset() {
    let fetcher = Arc::new(MockFetcher::new());
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    // nothing to reset
    assert!(!loader.reset(&key));

    loader.load(key.clone(), URL, Priority::Normal).await.unwrap_err();
    assert!(loader.reset(&key));
    assert_eq!(loader.load_state(&key), LoadState::Idle);
    assert!(!loader.reset(&key));
}

#[tokio::test]
async fn test_reset_does_not_interrupt_loading() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    fetcher.hold();
    let handle = loader.load(key.clone(), URL, Priority::Normal);
    fetcher.wait_for_fetches(URL, 1).await;

    assert!(!loader.reset(&key));
    assert!(matches!(loader.load_state(&key), LoadState::Loading { .. }));

    fetcher.release();
    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn test_dropping_last_listener_cancels_fetch() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    fetcher.hold();
    let first = loader.load(key.clone(), URL, Priority::Normal);
    let second = loader.load(key.clone(), URL, Priority::Normal);
    fetcher.wait_for_fetches(URL, 1).await;

    drop(first);
    assert_eq!(loader.state().listener_count(&key), 1);
    assert!(matches!(loader.load_state(&key), LoadState::Loading { .. }));

    drop(second);
    assert_eq!(loader.load_state(&key), LoadState::Idle);

    // a fresh load starts a new fetch
    fetcher.release();
    let loaded = loader.load(key.clone(), URL, Priority::Normal).await.unwrap();
    assert_eq!(loaded.origin, Origin::Network);
    assert_eq!(fetcher.fetches(URL), 2);
    assert_eq!(loader.stats().successes, 1);
}

#[tokio::test]
async fn test_workers_take_higher_priorities_first() {
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_blob("blocker", "blocker")
            .with_blob("low", "low")
            .with_blob("normal", "normal")
            .with_blob("critical", "critical"),
    );
    let config = LoaderConfig {
        max_workers: 1,
        ..loader_config()
    };
    let loader = setup_loader(fetcher.clone(), config);

    fetcher.hold();
    let blocker = loader.load(CacheKey::new("blocker"), "blocker", Priority::Low);
    fetcher.wait_for_fetches("blocker", 1).await;

    let handles = vec![
        blocker,
        loader.load(CacheKey::new("low"), "low", Priority::Low),
        loader.load(CacheKey::new("normal"), "normal", Priority::Normal),
        loader.load(CacheKey::new("critical"), "critical", Priority::Critical),
    ];
    assert_eq!(loader.stats().queued, 3);
    fetcher.release();

    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(
        fetcher.started(),
        ["blocker", "critical", "normal", "low"]
    );
}

#[tokio::test]
async fn test_joining_listener_escalates_queued_fetch() {
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_blob("blocker", "blocker")
            .with_blob("a", "a")
            .with_blob("b", "b"),
    );
    let config = LoaderConfig {
        max_workers: 1,
        ..loader_config()
    };
    let loader = setup_loader(fetcher.clone(), config);

    fetcher.hold();
    let blocker = loader.load(CacheKey::new("blocker"), "blocker", Priority::Low);
    fetcher.wait_for_fetches("blocker", 1).await;

    let a_low = loader.load(CacheKey::new("a"), "a", Priority::Low);
    let b = loader.load(CacheKey::new("b"), "b", Priority::Normal);
    let a_critical = loader.load(CacheKey::new("a"), "a", Priority::Critical);
    fetcher.release();

    let handles = vec![blocker, a_low, b, a_critical];
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(fetcher.started(), ["blocker", "a", "b"]);
    assert_eq!(loader.stats().dedup_hits, 1);
}

#[tokio::test]
async fn test_serves_disk_hits_without_fetching() {
    let fetcher = Arc::new(MockFetcher::new());
    let cache_dir = assetcache_test::tempdir();
    let cache = tiered_cache(Some(&cache_dir));
    let key = CacheKey::new(URL);
    assert!(cache.disk().unwrap().put(&key, b"image-a"));

    assetcache_test::setup();
    let runtime = tokio::runtime::Handle::current();
    let loader = assetcache_service::loader::PriorityLoader::new(
        loader_config(),
        fetcher.clone(),
        cache,
        &runtime,
    );

    let loaded = loader.load(key.clone(), URL, Priority::High).await.unwrap();
    assert_eq!(loaded.origin, Origin::Disk);
    assert_eq!(loaded.object.as_str(), "image-a");
    assert!(fetcher.started().is_empty());

    // the disk hit was promoted into memory
    assert_eq!(
        loader.cache().memory().priority_of(&key),
        Some(Priority::High)
    );
}

#[tokio::test]
async fn test_writes_through_to_disk() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let cache_dir = assetcache_test::tempdir();
    let cache = tiered_cache(Some(&cache_dir));

    assetcache_test::setup();
    let runtime = tokio::runtime::Handle::current();
    let loader = assetcache_service::loader::PriorityLoader::new(
        loader_config(),
        fetcher.clone(),
        Arc::clone(&cache),
        &runtime,
    );
    let key = CacheKey::new(URL);

    loader.load(key.clone(), URL, Priority::Normal).await.unwrap();

    let disk = cache.disk().unwrap();
    wait_until(|| disk.contains(&key)).await;
    assert_eq!(&disk.get(&key).unwrap()[..], b"image-a");
}

#[tokio::test]
async fn test_shutdown_cancels_pending_loads() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "image-a"));
    let loader = setup_loader(fetcher.clone(), loader_config());
    let key = CacheKey::new(URL);

    fetcher.hold();
    let handle = loader.load(key.clone(), URL, Priority::Normal);
    fetcher.wait_for_fetches(URL, 1).await;

    loader.shutdown();
    assert_eq!(handle.await.unwrap_err(), CacheError::Cancelled);

    let result = loader.load(key, URL, Priority::Normal).await;
    assert_eq!(result.unwrap_err(), CacheError::Cancelled);
}
