use std::sync::Arc;
use std::time::Duration;

use assetcache_service::caching::CacheKey;
use assetcache_service::config::PreloadConfig;
use assetcache_service::preload::PreloadRejection;
use assetcache_service::types::Priority;

use crate::{FixedProbe, MockFetcher, preload_config, setup_preloader, wait_until};

const URL: &str = "https://cdn.example.com/images/next.jpg";

/// A configuration whose quiescence window outlasts every test.
fn idle_config() -> PreloadConfig {
    PreloadConfig {
        quiescence: Duration::from_secs(60),
        ..preload_config()
    }
}

#[tokio::test]
async fn test_preload_loads_after_quiescence() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "next"));
    let probe = Arc::new(FixedProbe::new(0.1));
    let preloader = setup_preloader(fetcher.clone(), preload_config(), probe);
    let key = CacheKey::new(URL);

    preloader.schedule(key.clone(), URL, Priority::Low).unwrap();
    assert_eq!(preloader.session(&key).unwrap().priority, Priority::Low);

    wait_until(|| preloader.active_sessions() == 0).await;
    assert_eq!(fetcher.fetches(URL), 1);

    let stats = preloader.stats();
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn test_rejects_under_memory_pressure() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "next"));
    let probe = Arc::new(FixedProbe::new(0.85));
    let preloader = setup_preloader(fetcher.clone(), preload_config(), probe.clone());
    let key = CacheKey::new(URL);

    let result = preloader.schedule(key.clone(), URL, Priority::Normal);
    assert_eq!(result, Err(PreloadRejection::MemoryPressure));
    assert!(preloader.session(&key).is_none());
    assert_eq!(preloader.stats().rejected, 1);

    probe.set(0.5);
    preloader.schedule(key.clone(), URL, Priority::Normal).unwrap();
    wait_until(|| preloader.active_sessions() == 0).await;
    assert_eq!(fetcher.fetches(URL), 1);
}

#[tokio::test]
async fn test_rejects_duplicates_and_excess_sessions() {
    let fetcher = Arc::new(MockFetcher::new());
    let probe = Arc::new(FixedProbe::new(0.0));
    let config = PreloadConfig {
        max_sessions: 2,
        ..idle_config()
    };
    let preloader = setup_preloader(fetcher, config, probe);

    preloader.schedule(CacheKey::new("a"), "a", Priority::Normal).unwrap();
    assert_eq!(
        preloader.schedule(CacheKey::new("a"), "a", Priority::Normal),
        Err(PreloadRejection::AlreadyScheduled)
    );
    preloader.schedule(CacheKey::new("b"), "b", Priority::Normal).unwrap();
    assert_eq!(
        preloader.schedule(CacheKey::new("c"), "c", Priority::Normal),
        Err(PreloadRejection::TooManySessions)
    );

    assert_eq!(preloader.active_sessions(), 2);
    let stats = preloader.stats();
    assert_eq!(stats.scheduled, 2);
    assert_eq!(stats.rejected, 2);
}

#[tokio::test]
async fn test_cancel_during_quiescence() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "next"));
    let probe = Arc::new(FixedProbe::new(0.0));
    let preloader = setup_preloader(fetcher.clone(), idle_config(), probe);
    let key = CacheKey::new(URL);

    preloader.schedule(key.clone(), URL, Priority::Normal).unwrap();
    assert!(preloader.cancel(&key));
    assert!(preloader.session(&key).is_none());

    // cancelling again, or an unknown key, does nothing
    assert!(!preloader.cancel(&key));
    assert!(!preloader.cancel(&CacheKey::new("unknown")));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetcher.fetches(URL), 0);
    assert_eq!(preloader.stats().cancelled, 1);

    // the key can be scheduled again
    preloader.schedule(key, URL, Priority::Normal).unwrap();
}

#[tokio::test]
async fn test_cancel_gives_up_running_load() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(URL, "next"));
    let probe = Arc::new(FixedProbe::new(0.0));
    let preloader = setup_preloader(fetcher.clone(), preload_config(), probe);
    let key = CacheKey::new(URL);

    fetcher.hold();
    preloader.schedule(key.clone(), URL, Priority::Normal).unwrap();
    fetcher.wait_for_fetches(URL, 1).await;

    assert!(preloader.cancel(&key));
    assert_eq!(preloader.active_sessions(), 0);
    fetcher.release();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(preloader.stats().completed, 0);
}

#[tokio::test]
async fn test_disabled_preloader() {
    let fetcher = Arc::new(MockFetcher::new());
    let probe = Arc::new(FixedProbe::new(0.0));
    let config = PreloadConfig {
        enabled: false,
        ..idle_config()
    };
    let preloader = setup_preloader(fetcher, config, probe);

    assert!(!preloader.is_enabled());
    assert_eq!(
        preloader.schedule(CacheKey::new("a"), "a", Priority::Normal),
        Err(PreloadRejection::Disabled)
    );

    preloader.enable();
    preloader.schedule(CacheKey::new("a"), "a", Priority::Normal).unwrap();
    preloader.schedule(CacheKey::new("b"), "b", Priority::Normal).unwrap();

    // disabling cancels everything that is scheduled
    preloader.disable();
    assert_eq!(preloader.active_sessions(), 0);
    assert_eq!(preloader.stats().cancelled, 2);
}

#[tokio::test]
async fn test_schedule_neighbors() {
    let fetcher = Arc::new(MockFetcher::new());
    let probe = Arc::new(FixedProbe::new(0.0));
    let preloader = setup_preloader(fetcher, idle_config(), probe);

    let request = |index: usize| {
        let url = format!("https://cdn.example.com/gallery/{index}.jpg");
        Some((CacheKey::new(&url), url))
    };

    let admitted = preloader.schedule_neighbors(5, 10, 4, request);
    assert_eq!(admitted, 4);

    let priority = |index: usize| {
        let (key, _) = request(index).unwrap();
        preloader.session(&key).map(|session| session.priority)
    };
    assert_eq!(priority(6), Some(Priority::Normal));
    assert_eq!(priority(4), Some(Priority::Normal));
    assert_eq!(priority(7), Some(Priority::Low));
    assert_eq!(priority(3), Some(Priority::Low));
    assert_eq!(priority(8), None);
}

#[tokio::test]
async fn test_schedule_neighbors_at_the_edge() {
    let fetcher = Arc::new(MockFetcher::new());
    let probe = Arc::new(FixedProbe::new(0.0));
    let preloader = setup_preloader(fetcher, idle_config(), probe);

    let admitted = preloader.schedule_neighbors(0, 2, 4, |index| {
        let url = format!("https://cdn.example.com/gallery/{index}.jpg");
        Some((CacheKey::new(&url), url))
    });

    assert_eq!(admitted, 1);
    assert_eq!(preloader.active_sessions(), 1);
}
