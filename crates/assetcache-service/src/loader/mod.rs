//! Deduplicating, prioritized loading of assets.
//!
//! Every [`PriorityLoader::load`] call first consults the memory tier. On a miss, the call is
//! registered with the [`LoadStateMachine`]: the first request for a key starts a loading cycle
//! and queues a job, concurrent requests for the same key join that cycle. A fixed pool of
//! workers takes jobs off the [`JobQueue`], highest priority first, and runs them:
//!
//! 1. look the key up in the tiers, which covers blobs that are already on disk,
//! 2. fetch the blob through the [`Fetcher`], retrying transient failures with backoff,
//! 3. decode it and write it through to both tiers.
//!
//! The single outcome is delivered to every listener of the cycle.
//!
//! ### Metrics
//!
//! - `loader.fetch`: Every fetch attempt.
//! - `loader.retry`: Fetch attempts that are retries of a failed attempt.
//! - `loader.dedup`: Requests that joined an in-flight fetch.
//! - `loader.done`: Completed loading cycles, tagged by `status` and `origin`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError, CacheKey, Decoder, TieredCache};
use crate::config::LoaderConfig;
use crate::download::{Fetcher, ProgressSink, RetryPolicy, retry};
use crate::types::{Origin, Priority};
use crate::utils::futures::{m, measure};

mod queue;
mod state;

pub use queue::JobQueue;
pub use state::{Attach, Claim, Job, LoadHandle, LoadState, LoadStateMachine, Ticket};

/// A successfully loaded object, along with the tier it was served from.
#[derive(Debug)]
pub struct Loaded<O> {
    pub object: Arc<O>,
    pub origin: Origin,
}

impl<O> Clone for Loaded<O> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            origin: self.origin,
        }
    }
}

/// The future returned by [`PriorityLoader::load`].
pub type LoadFuture<O> = LoadHandle<Loaded<O>>;

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    fetches: AtomicU64,
    dedup_hits: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// All calls to `load`.
    pub requests: u64,
    /// Fetch attempts, including retries.
    pub fetches: u64,
    /// Requests that joined an in-flight fetch.
    pub dedup_hits: u64,
    /// Loading cycles that completed successfully.
    pub successes: u64,
    /// Loading cycles that failed.
    pub failures: u64,
    /// Fetch attempts that were retries.
    pub retries: u64,
    /// Keys that are currently loading.
    pub in_flight: u64,
    /// Jobs waiting for a worker.
    pub queued: u64,
}

struct Inner<D: Decoder> {
    config: LoaderConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<TieredCache<D>>,
    state: LoadStateMachine<Loaded<D::Object>>,
    queue: JobQueue,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Loads assets through the cache tiers, fetching and decoding them on a miss.
pub struct PriorityLoader<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for PriorityLoader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder> std::fmt::Debug for PriorityLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityLoader")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Decoder> PriorityLoader<D> {
    /// Creates the loader and spawns its workers onto `runtime`.
    pub fn new(
        config: LoaderConfig,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<TieredCache<D>>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            fetcher,
            cache,
            state: LoadStateMachine::new(config.error_ttl),
            queue: JobQueue::default(),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });

        let workers = config.max_workers.max(1);
        for worker in 0..workers {
            runtime.spawn(Arc::clone(&inner).work(worker));
        }
        tracing::debug!("Started {} loader workers", workers);

        Self { inner }
    }

    pub fn cache(&self) -> &Arc<TieredCache<D>> {
        &self.inner.cache
    }

    pub fn state(&self) -> &LoadStateMachine<Loaded<D::Object>> {
        &self.inner.state
    }

    /// Loads `key`, fetching it from `url` on a cache miss.
    ///
    /// Concurrent loads of the same key share a single fetch. A later load with a higher priority
    /// moves a queued fetch up. Dropping the returned future gives up interest; a fetch without
    /// any remaining interest is cancelled.
    pub fn load(&self, key: CacheKey, url: &str, priority: Priority) -> LoadFuture<D::Object> {
        let inner = &self.inner;
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        if inner.shutdown.is_cancelled() {
            return LoadHandle::ready(Err(CacheError::Cancelled));
        }

        if let Some(object) = inner.cache.memory().get(&key) {
            tracing::trace!("Serving `{}` from memory", key);
            return LoadHandle::ready(Ok(Loaded {
                object,
                origin: Origin::Memory,
            }));
        }

        match inner.state.attach(key.clone(), url, priority) {
            Attach::Started { handle, job } => {
                inner.queue.push(job);
                handle
            }
            Attach::Joined { handle, escalated } => {
                inner.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
                metric!(counter("loader.dedup") += 1);
                if let Some(job) = escalated {
                    tracing::debug!("Escalated `{}` to {} priority", key, job.priority);
                    inner.queue.push(job);
                }
                handle
            }
            Attach::Failed(err) => LoadHandle::ready(Err(err)),
        }
    }

    /// Discards a previous outcome of `key` and loads it again.
    pub fn retry(&self, key: CacheKey, url: &str, priority: Priority) -> LoadFuture<D::Object> {
        self.inner.state.reset(&key);
        self.load(key, url, priority)
    }

    /// Returns `key` to idle, if its last load has finished.
    pub fn reset(&self, key: &CacheKey) -> bool {
        self.inner.state.reset(key)
    }

    /// The state of `key`, reporting [`LoadState::Success`] while its object is in memory.
    pub fn load_state(&self, key: &CacheKey) -> LoadState {
        match self.inner.state.state(key) {
            LoadState::Idle if self.inner.cache.memory().contains(key) => LoadState::Success,
            state => state,
        }
    }

    pub fn stats(&self) -> LoaderStats {
        let counters = &self.inner.counters;
        LoaderStats {
            requests: counters.requests.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            dedup_hits: counters.dedup_hits.load(Ordering::Relaxed),
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            in_flight: self.inner.state.in_flight() as u64,
            queued: self.inner.queue.len() as u64,
        }
    }

    /// Stops all workers and fails every pending load with [`CacheError::Cancelled`].
    ///
    /// Loads issued afterwards fail right away.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.state.cancel_all();
        tracing::debug!("Loader shut down");
    }
}

impl<D: Decoder> Inner<D> {
    async fn work(self: Arc<Self>, worker: usize) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = self.queue.pop() => job,
            };

            let Some(claim) = self.state.claim(&job) else {
                tracing::trace!("Skipping stale job for `{}`", job.key);
                continue;
            };

            let outcome = tokio::select! {
                biased;
                _ = claim.ticket.cancelled() => Err(CacheError::Cancelled),
                outcome = measure("loader.run", m::result, self.run(&claim)) => outcome,
            };

            match &outcome {
                Ok(loaded) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    metric!(
                        counter("loader.done") += 1,
                        "status" => "ok",
                        "origin" => loaded.origin.as_str(),
                    );
                }
                // nobody is waiting for cancelled loads
                Err(CacheError::Cancelled) => {}
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    metric!(
                        counter("loader.done") += 1,
                        "status" => err.metrics_tag(),
                        "origin" => Origin::Network.as_str(),
                    );
                }
            }

            self.state.complete(&claim.ticket, outcome);
        }
        tracing::trace!("Loader worker {} stopped", worker);
    }

    async fn run(&self, claim: &Claim) -> CacheContents<Loaded<D::Object>> {
        let key = claim.ticket.key();

        if let Some((object, origin)) = self.cache.lookup(key, claim.priority).await {
            return Ok(Loaded { object, origin });
        }

        let blob = self.fetch(key, &claim.url).await?;
        let object = Arc::new(self.cache.decode(blob.clone()).await?);
        self.cache
            .put(key.clone(), blob, Arc::clone(&object), claim.priority)
            .await;

        Ok(Loaded {
            object,
            origin: Origin::Network,
        })
    }

    /// Fetches a blob, retrying transient failures.
    ///
    /// Every attempt is bounded by the sum of the connect and read timeouts.
    async fn fetch(&self, key: &CacheKey, url: &str) -> CacheContents<Bytes> {
        let timeout = self.config.fetch_timeout();
        let progress = {
            let state = self.state.clone();
            let key = key.clone();
            ProgressSink::new(move |percent| state.set_progress(&key, percent))
        };

        retry(RetryPolicy::from_config(&self.config), |attempt| {
            self.counters.fetches.fetch_add(1, Ordering::Relaxed);
            metric!(counter("loader.fetch") += 1);
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                metric!(counter("loader.retry") += 1);
            }
            tracing::trace!("Fetching `{}` (attempt {})", url, attempt + 1);

            let fetch = self.fetcher.fetch(url, &progress);
            async move {
                tokio::time::timeout(timeout, fetch)
                    .await
                    .unwrap_or(Err(CacheError::Timeout(timeout)))
            }
        })
        .await
    }
}
