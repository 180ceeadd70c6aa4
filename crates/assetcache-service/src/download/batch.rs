//! Downloads of multiple assets at once.
//!
//! Every item of a batch is admitted or skipped according to the [`DownloadStrategy`] and the
//! current [`Connection`]. Admitted items are loaded through the [`PriorityLoader`], bounded by a
//! semaphore that is shared by all batches. Failures are isolated per item.
//!
//! ### Metrics
//!
//! - `batch.item`: Finished items, tagged by `status`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::caching::{CacheContents, CacheError, CacheKey, Decoder};
use crate::config::DownloadConfig;
use crate::loader::PriorityLoader;
use crate::types::{Origin, Priority};

/// Decides which items of a batch are downloaded automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    /// Download everything.
    Always,
    /// Download only on an unmetered connection.
    WifiOnly,
    /// Download small assets right away, and large ones only on an unmetered connection.
    #[default]
    Smart,
    /// Download nothing automatically.
    Manual,
}

impl DownloadStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::WifiOnly => "wifi_only",
            Self::Smart => "smart",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "wifi_only" => Ok(Self::WifiOnly),
            "smart" => Ok(Self::Smart),
            "manual" => Ok(Self::Manual),
            _ => Err(format!(
                "unknown download strategy `{s}`, expected one of always, wifi_only, smart, manual"
            )),
        }
    }
}

/// The kind of network the device is connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connection {
    /// Wifi, ethernet, or anything else without a data cap.
    Unmetered,
    /// Cellular, or any other connection where data is billed.
    Metered,
}

/// Reports the current [`Connection`].
pub trait NetworkMonitor: Send + Sync + 'static {
    fn connection(&self) -> Connection;
}

/// The kind of asset, derived from the file extension of its url.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Thumbnail,
    Image,
    Video,
    Archive,
    Other,
}

impl AssetClass {
    pub fn from_url(url: &str) -> Self {
        let path = match url::Url::parse(url) {
            Ok(url) => url.path().to_ascii_lowercase(),
            // relative or otherwise unparseable urls
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase(),
        };

        let file_name = path.rsplit('/').next().unwrap_or_default();
        let Some((_, extension)) = file_name.rsplit_once('.') else {
            return Self::Other;
        };

        match extension {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" if path.contains("thumb") => {
                Self::Thumbnail
            }
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => Self::Image,
            "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" => Self::Video,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" => Self::Archive,
            _ => Self::Other,
        }
    }

    /// Whether assets of this class are considered large, regardless of their actual size.
    pub fn is_large(self) -> bool {
        matches!(self, Self::Video | Self::Archive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Image => "image",
            Self::Video => "video",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

/// One asset of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchItem {
    pub key: CacheKey,
    pub url: String,
    pub priority: Priority,
    /// The expected size in bytes, if known up front.
    pub size_hint: Option<u64>,
    /// Overrides the class derived from the url.
    pub class: Option<AssetClass>,
}

impl BatchItem {
    /// An item keyed by its url, at normal priority.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: CacheKey::new(&url),
            url,
            priority: Priority::Normal,
            size_hint: None,
            class: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn with_class(mut self, class: AssetClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn class(&self) -> AssetClass {
        self.class.unwrap_or_else(|| AssetClass::from_url(&self.url))
    }
}

/// The terminal state of a batch item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded(Origin),
    Failed(CacheError),
    /// The item was not admitted by the download strategy.
    Skipped,
}

impl ItemOutcome {
    fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "ok",
            Self::Failed(_) => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl From<CacheContents<Origin>> for ItemOutcome {
    fn from(result: CacheContents<Origin>) -> Self {
        match result {
            Ok(origin) => Self::Succeeded(origin),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Progress notifications of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchEvent {
    /// Item `index` reached its terminal state.
    ItemDone {
        index: usize,
        key: CacheKey,
        outcome: ItemOutcome,
    },
    /// `completed` out of `total` items are done. Sent after every [`BatchEvent::ItemDone`].
    Progress { completed: usize, total: usize },
}

/// The aggregate outcome of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded(_) => self.succeeded += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Receives the events and the summary of a running batch.
#[derive(Debug)]
pub struct BatchHandle {
    events: mpsc::UnboundedReceiver<BatchEvent>,
    summary: oneshot::Receiver<BatchSummary>,
}

impl BatchHandle {
    /// The next event, or `None` once all events were delivered.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Waits for every item to reach a terminal state.
    ///
    /// Fails with [`CacheError::Cancelled`] if the batch was abandoned, for example because the
    /// runtime shut down.
    pub async fn finished(self) -> CacheContents<BatchSummary> {
        self.summary.await.map_err(|_| CacheError::Cancelled)
    }
}

/// Runs batches of downloads with a bounded number of items in flight.
pub struct BatchDownloader<D: Decoder> {
    config: DownloadConfig,
    loader: PriorityLoader<D>,
    network: Arc<dyn NetworkMonitor>,
    permits: Arc<Semaphore>,
    runtime: tokio::runtime::Handle,
}

impl<D: Decoder> fmt::Debug for BatchDownloader<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDownloader")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl<D: Decoder> BatchDownloader<D> {
    pub fn new(
        config: DownloadConfig,
        loader: PriorityLoader<D>,
        network: Arc<dyn NetworkMonitor>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            config,
            loader,
            network,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            runtime,
        }
    }

    /// The strategy used by [`download`](Self::download).
    pub fn default_strategy(&self) -> DownloadStrategy {
        self.config.strategy
    }

    /// Whether `item` is downloaded under `strategy` on `connection`.
    pub fn admits(&self, item: &BatchItem, strategy: DownloadStrategy, connection: Connection) -> bool {
        let unmetered = connection == Connection::Unmetered;
        match strategy {
            DownloadStrategy::Always => true,
            DownloadStrategy::WifiOnly => unmetered,
            DownloadStrategy::Smart => unmetered || !self.is_large(item),
            DownloadStrategy::Manual => false,
        }
    }

    fn is_large(&self, item: &BatchItem) -> bool {
        item.class().is_large()
            || item
                .size_hint
                .is_some_and(|size| size > self.config.smart_size_threshold)
    }

    /// Downloads a batch with the configured strategy.
    pub fn download(&self, items: Vec<BatchItem>) -> BatchHandle {
        self.download_batch(items, self.config.strategy)
    }

    /// Downloads a batch.
    ///
    /// Items that are not admitted by `strategy` finish as [`ItemOutcome::Skipped`]. The summary
    /// resolves once every item reached a terminal state.
    pub fn download_batch(&self, items: Vec<BatchItem>, strategy: DownloadStrategy) -> BatchHandle {
        let (event_sender, events) = mpsc::unbounded_channel();
        let (summary_sender, summary) = oneshot::channel();

        let connection = self.network.connection();
        let total = items.len();
        let mut done = BatchSummary {
            total,
            ..Default::default()
        };

        let finish = move |summary: &mut BatchSummary, index: usize, key: CacheKey, outcome: ItemOutcome| {
            metric!(counter("batch.item") += 1, "status" => outcome.metrics_tag());
            summary.record(&outcome);
            // the receiver may have lost interest in events
            event_sender
                .send(BatchEvent::ItemDone {
                    index,
                    key,
                    outcome,
                })
                .ok();
            event_sender
                .send(BatchEvent::Progress {
                    completed: summary.completed(),
                    total,
                })
                .ok();
        };

        let pending = FuturesUnordered::new();
        let mut skipped = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            if !self.admits(&item, strategy, connection) {
                skipped.push((index, item.key));
                continue;
            }

            let loader = self.loader.clone();
            let permits = Arc::clone(&self.permits);
            pending.push(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => loader
                        .load(item.key.clone(), &item.url, item.priority)
                        .await
                        .map(|loaded| loaded.origin),
                    Err(_) => Err(CacheError::Cancelled),
                };
                (index, item.key, ItemOutcome::from(outcome))
            });
        }

        tracing::debug!(
            "Starting batch of {} items with strategy {} ({} skipped)",
            total,
            strategy,
            skipped.len(),
        );

        self.runtime.spawn(async move {
            let mut finish = finish;
            let mut pending = pending;

            for (index, key) in skipped {
                finish(&mut done, index, key, ItemOutcome::Skipped);
            }
            while let Some((index, key, outcome)) = pending.next().await {
                finish(&mut done, index, key, outcome);
            }

            tracing::debug!(
                "Finished batch: {} succeeded, {} failed, {} skipped",
                done.succeeded,
                done.failed,
                done.skipped,
            );
            summary_sender.send(done).ok();
        });

        BatchHandle { events, summary }
    }
}
