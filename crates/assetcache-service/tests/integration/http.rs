use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetcache_service::caching::{CacheError, CacheKey};
use assetcache_service::config::LoaderConfig;
use assetcache_service::download::{DownloadTimeouts, Fetcher, HttpFetcher, ProgressSink};
use assetcache_service::types::{Origin, Priority};
use bytes::Bytes;
use futures::future::join_all;

use crate::{Server, loader_config, setup_loader};

fn server() -> Server {
    Server::new([
        ("photo.jpg", Bytes::from_static(b"a photo of a cat")),
        ("empty.txt", Bytes::new()),
    ])
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(DownloadTimeouts::default()).unwrap()
}

#[tokio::test]
async fn test_download_with_progress() {
    assetcache_test::setup();
    let server = server();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let progress = {
        let reports = Arc::clone(&reports);
        ProgressSink::new(move |percent| reports.lock().unwrap().push(percent))
    };

    let blob = fetcher()
        .fetch(&server.url("assets/photo.jpg"), &progress)
        .await
        .unwrap();

    assert_eq!(&blob[..], b"a photo of a cat");
    assert_eq!(server.hits("/assets/photo.jpg"), 1);
    assert_eq!(reports.lock().unwrap().last(), Some(&100));
}

#[tokio::test]
async fn test_download_empty() {
    assetcache_test::setup();
    let server = server();

    let blob = fetcher()
        .fetch(&server.url("assets/empty.txt"), &ProgressSink::noop())
        .await
        .unwrap();

    assert!(blob.is_empty());
}

#[tokio::test]
async fn test_not_found() {
    assetcache_test::setup();
    let server = server();

    let result = fetcher()
        .fetch(&server.url("assets/missing.jpg"), &ProgressSink::noop())
        .await;

    assert_eq!(result, Err(CacheError::NotFound));
}

#[tokio::test]
async fn test_client_errors_are_not_found() {
    assetcache_test::setup();
    let server = server();

    let result = fetcher()
        .fetch(&server.url("status/403"), &ProgressSink::noop())
        .await;

    assert_eq!(result, Err(CacheError::NotFound));
}

#[tokio::test]
async fn test_server_errors_are_retryable() {
    assetcache_test::setup();
    let server = server();

    let err = fetcher()
        .fetch(&server.url("status/503"), &ProgressSink::noop())
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Network(_)));
    assert!(err.can_retry());
}

#[tokio::test]
async fn test_connection_refused() {
    assetcache_test::setup();
    let url = {
        let server = server();
        server.url("assets/photo.jpg")
    };
    // give the aborted server task a chance to release its socket
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = fetcher()
        .fetch(&url, &ProgressSink::noop())
        .await
        .unwrap_err();

    assert!(err.can_retry(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_loader_deduplicates_requests() {
    let server = server();
    let loader = setup_loader(Arc::new(fetcher()), loader_config());
    let url = server.url("assets/photo.jpg");
    let key = CacheKey::new(&url);

    let handles: Vec<_> = (0..5)
        .map(|_| loader.load(key.clone(), &url, Priority::Normal))
        .collect();
    for result in join_all(handles).await {
        let loaded = result.unwrap();
        assert_eq!(loaded.origin, Origin::Network);
        assert_eq!(loaded.object.as_str(), "a photo of a cat");
    }

    assert_eq!(server.hits("/assets/photo.jpg"), 1);
}

#[tokio::test]
async fn test_loader_times_out_slow_responses() {
    let server = server();
    let config = LoaderConfig {
        connect_timeout: Duration::from_millis(50),
        read_timeout: Duration::from_millis(50),
        max_retries: 1,
        ..loader_config()
    };
    let fetcher = HttpFetcher::new((&config).into()).unwrap();
    let loader = setup_loader(Arc::new(fetcher), config);
    let url = server.url("delay/2000/photo.jpg");

    let result = loader.load(CacheKey::new(&url), &url, Priority::Normal).await;

    assert!(matches!(result, Err(CacheError::Timeout(_))));
    assert_eq!(server.hits("/delay/2000/photo.jpg"), 2);
}
