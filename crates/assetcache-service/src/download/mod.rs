//! Fetching of remote assets.
//!
//! The engine only depends on the [`Fetcher`] contract. [`HttpFetcher`] is the reqwest based
//! implementation used by hosts, tests substitute a scripted one.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::{CacheContents, CacheError};
use crate::config::LoaderConfig;

pub mod batch;
mod http;

pub use self::http::{DownloadTimeouts, HttpFetcher, create_client};

/// The fetch collaborator.
///
/// Implementations report failures as [`CacheError`]s and decide retryability through the
/// variant: [`CacheError::Network`] and [`CacheError::Timeout`] are retried by the loader,
/// anything else is final.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetches the full contents behind `url`.
    ///
    /// Progress may be reported through `progress` whenever the total size is known.
    fn fetch<'a>(&'a self, url: &'a str, progress: &'a ProgressSink)
    -> BoxFuture<'a, CacheContents<Bytes>>;
}

/// Receives download progress from a [`Fetcher`].
pub struct ProgressSink {
    report: Box<dyn Fn(u8) + Send + Sync>,
}

impl ProgressSink {
    pub fn new<F: Fn(u8) + Send + Sync + 'static>(report: F) -> Self {
        Self {
            report: Box::new(report),
        }
    }

    /// A sink that discards all progress.
    pub fn noop() -> Self {
        Self::new(|_| ())
    }

    /// Reports that `done` out of `total` bytes have been received.
    ///
    /// Nothing is reported when the total size is unknown.
    pub fn report(&self, done: u64, total: Option<u64>) {
        let Some(total) = total.filter(|total| *total > 0) else {
            return;
        };
        let percent = done.min(total).saturating_mul(100) / total;
        (self.report)(percent as u8);
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

/// Exponential backoff for retryable fetch failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
        }
    }

    /// The delay before retry number `retry`, counting from zero.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs the future returned by `task_gen` until it succeeds, fails permanently, or the retries
/// of `policy` are exhausted.
///
/// `task_gen` receives the number of the attempt, starting at `0`. Only errors for which
/// [`CacheError::can_retry`] holds are retried.
pub async fn retry<G, F, T>(policy: RetryPolicy, mut task_gen: G) -> CacheContents<T>
where
    G: FnMut(u32) -> F,
    F: Future<Output = CacheContents<T>>,
{
    let mut attempt = 0;
    loop {
        let result = task_gen(attempt).await;

        match result {
            Err(ref err) if err.can_retry() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    error = err as &dyn std::error::Error,
                    "Attempt {} failed, retrying in {:?}",
                    attempt + 1,
                    delay,
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            result => break result,
        }
    }
}

/// Keeps the innermost error message, which is usually the most descriptive one.
pub(crate) fn innermost_error_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut source = err;
    while let Some(inner) = source.source() {
        source = inner;
    }
    source.to_string()
}

impl From<&LoaderConfig> for DownloadTimeouts {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
        }
    }
}
