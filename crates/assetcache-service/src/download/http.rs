use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;

use crate::caching::{CacheContents, CacheError};

use super::{Fetcher, ProgressSink, innermost_error_message};

/// Upper bound for the buffer preallocated from a `Content-Length` header.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Timeouts of a single HTTP request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// Time to establish a connection.
    pub connect: Duration,
    /// Time allowed between two reads of the response.
    pub read: Duration,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
        }
    }
}

pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Fetches assets over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(timeouts: DownloadTimeouts) -> reqwest::Result<Self> {
        Ok(Self {
            client: create_client(&timeouts)?,
            timeouts,
        })
    }

    async fn download(&self, url: &str, progress: &ProgressSink) -> CacheContents<Bytes> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.download_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        tracing::trace!("Success hitting `{}`", url);

        let total = response.content_length();
        let mut body = BytesMut::with_capacity(total.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
        progress.report(0, total);

        while let Some(chunk) = response.chunk().await.map_err(|e| self.download_error(e))? {
            body.extend_from_slice(&chunk);
            progress.report(body.len() as u64, total);
        }

        Ok(body.freeze())
    }

    /// Converts a transport error, keeping the innermost message for diagnostics.
    fn download_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            let timeout = match err.is_connect() {
                true => self.timeouts.connect,
                false => self.timeouts.read,
            };
            return CacheError::Timeout(timeout);
        }

        CacheError::Network(innermost_error_message(&err))
    }
}

/// Infers the [`CacheError`] from the status code of an unsuccessful response.
fn status_error(url: &str, status: StatusCode) -> CacheError {
    if status.is_client_error() {
        tracing::debug!("Unexpected client error status code from `{}`: {}", url, status);
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{}`: {}", url, status);
        CacheError::Network(status.to_string())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        progress: &'a ProgressSink,
    ) -> BoxFuture<'a, CacheContents<Bytes>> {
        self.download(url, progress).boxed()
    }
}
