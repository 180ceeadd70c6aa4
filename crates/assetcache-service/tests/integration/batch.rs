use std::sync::Arc;
use std::time::Duration;

use assetcache_service::caching::{CacheError, CacheKey};
use assetcache_service::config::DownloadConfig;
use assetcache_service::download::batch::{
    BatchDownloader, BatchEvent, BatchItem, BatchSummary, DownloadStrategy, ItemOutcome,
    NetworkMonitor,
};
use assetcache_service::types::Origin;

use crate::{FixedNetwork, MockFetcher, TestDecoder, loader_config, setup_loader};

fn url(name: &str) -> String {
    format!("https://cdn.example.com/media/{name}")
}

fn setup_downloader(
    fetcher: Arc<MockFetcher>,
    network: FixedNetwork,
    config: DownloadConfig,
) -> BatchDownloader<TestDecoder> {
    let loader = setup_loader(fetcher, loader_config());
    let network = Arc::new(network) as Arc<dyn NetworkMonitor>;
    BatchDownloader::new(config, loader, network, tokio::runtime::Handle::current())
}

#[tokio::test]
async fn test_smart_batch_with_failure() {
    let names = ["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"];
    let mut fetcher = MockFetcher::new();
    for name in &names[..4] {
        fetcher = fetcher.with_blob(&url(name), *name);
    }
    let fetcher = Arc::new(fetcher.with_error(&url("5.jpg"), CacheError::NotFound));
    let downloader = setup_downloader(
        fetcher.clone(),
        FixedNetwork::unmetered(),
        DownloadConfig::default(),
    );
    assert_eq!(downloader.default_strategy(), DownloadStrategy::Smart);

    let items = names.iter().map(|name| BatchItem::new(url(name))).collect();
    let mut handle = downloader.download(items);

    let mut done = Vec::new();
    let mut last_progress = None;
    while let Some(event) = handle.next_event().await {
        match event {
            BatchEvent::ItemDone { index, outcome, .. } => done.push((index, outcome)),
            BatchEvent::Progress { completed, total } => last_progress = Some((completed, total)),
        }
    }
    assert_eq!(last_progress, Some((5, 5)));
    assert_eq!(done.len(), 5);
    for (index, outcome) in &done {
        match index {
            4 => assert_eq!(outcome, &ItemOutcome::Failed(CacheError::NotFound)),
            _ => assert_eq!(outcome, &ItemOutcome::Succeeded(Origin::Network)),
        }
    }

    let summary = handle.finished().await.unwrap();
    assert_eq!(
        summary,
        BatchSummary {
            succeeded: 4,
            failed: 1,
            skipped: 0,
            total: 5,
        }
    );
    assert_eq!(fetcher.total_fetches(), 5);
}

#[tokio::test]
async fn test_manual_skips_everything() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(&url("1.jpg"), "1"));
    let downloader = setup_downloader(
        fetcher.clone(),
        FixedNetwork::unmetered(),
        DownloadConfig {
            strategy: DownloadStrategy::Manual,
            ..Default::default()
        },
    );

    let items = vec![BatchItem::new(url("1.jpg")), BatchItem::new(url("2.mp4"))];
    let summary = downloader.download(items).finished().await.unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.completed(), 2);
    assert!(fetcher.started().is_empty());
}

#[tokio::test]
async fn test_wifi_only_on_metered_connection() {
    let fetcher = Arc::new(MockFetcher::new().with_blob(&url("1.jpg"), "1"));
    let network = FixedNetwork::metered();
    let downloader = setup_downloader(fetcher.clone(), network, DownloadConfig::default());

    let items = vec![BatchItem::new(url("1.jpg"))];
    let summary = downloader
        .download_batch(items, DownloadStrategy::WifiOnly)
        .finished()
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(fetcher.started().is_empty());
}

#[tokio::test]
async fn test_smart_skips_large_items_on_metered_connection() {
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_blob(&url("photo.jpg"), "photo")
            .with_blob(&url("clip.mp4"), "clip")
            .with_blob(&url("poster.png"), "poster"),
    );
    let downloader = setup_downloader(
        fetcher.clone(),
        FixedNetwork::metered(),
        DownloadConfig::default(),
    );

    let items = vec![
        BatchItem::new(url("photo.jpg")),
        BatchItem::new(url("clip.mp4")),
        BatchItem::new(url("poster.png")).with_size_hint(50 * 1024 * 1024),
    ];
    let mut handle = downloader.download(items);

    let mut skipped = Vec::new();
    while let Some(event) = handle.next_event().await {
        if let BatchEvent::ItemDone {
            key,
            outcome: ItemOutcome::Skipped,
            ..
        } = event
        {
            skipped.push(key);
        }
    }
    assert_eq!(
        skipped,
        [CacheKey::new(url("clip.mp4")), CacheKey::new(url("poster.png"))]
    );

    let summary = handle.finished().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(fetcher.started(), [url("photo.jpg")]);
}

#[tokio::test]
async fn test_bounded_concurrency() {
    let names = ["1.jpg", "2.jpg", "3.jpg"];
    let mut fetcher = MockFetcher::new();
    for name in names {
        fetcher = fetcher.with_blob(&url(name), name);
    }
    let fetcher = Arc::new(fetcher);
    let downloader = setup_downloader(
        fetcher.clone(),
        FixedNetwork::unmetered(),
        DownloadConfig {
            strategy: DownloadStrategy::Always,
            max_concurrent: 1,
            ..Default::default()
        },
    );

    fetcher.hold();
    let items = names.iter().map(|name| BatchItem::new(url(name))).collect();
    let handle = downloader.download(items);

    crate::wait_until(|| fetcher.total_fetches() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetcher.total_fetches(), 1);

    fetcher.release();
    let summary = handle.finished().await.unwrap();
    assert_eq!(summary.succeeded, 3);
    assert_eq!(fetcher.total_fetches(), 3);
}

#[tokio::test]
async fn test_empty_batch() {
    let fetcher = Arc::new(MockFetcher::new());
    let downloader = setup_downloader(fetcher, FixedNetwork::unmetered(), Default::default());

    let mut handle = downloader.download(Vec::new());
    assert_eq!(handle.next_event().await, None);
    assert_eq!(handle.finished().await.unwrap(), BatchSummary::default());
}
