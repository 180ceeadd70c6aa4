//! Helpers for testing the asset cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk tier operates on a directory
//!    that no longer exists.
//!
//!  - When using [`Server`], make sure that the server is held until all requests to it have
//!    been made. Dropping it stops serving, and all further requests fail.
//!
//!  - Prefer [`MockFetcher`] over the [`Server`] for everything that does not test the HTTP
//!    fetcher itself. It counts fetches per url and can hold fetches in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetcache_service::caching::{CacheContents, CacheError, Decoder};
use assetcache_service::download::batch::{Connection, NetworkMonitor};
use assetcache_service::download::{Fetcher, ProgressSink};
use assetcache_service::preload::MemoryProbe;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the assetcache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("assetcache_service=trace,assetcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition did not hold in time");
}

#[derive(Debug, Default)]
struct Script {
    /// Responses handed out in order. The last one repeats.
    responses: VecDeque<CacheContents<Bytes>>,
    fetches: usize,
}

/// A scriptable [`Fetcher`].
///
/// Urls without a script fail with [`CacheError::NotFound`].
#[derive(Debug)]
pub struct MockFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
    delay: Mutex<Option<Duration>>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Default::default(),
            started: Default::default(),
            gate: watch::channel(true).0,
            delay: Default::default(),
        }
    }

    /// Serves `blob` for `url`.
    pub fn with_blob(self, url: &str, blob: impl Into<Bytes>) -> Self {
        self.with_responses(url, [Ok(blob.into())])
    }

    /// Fails every fetch of `url` with `error`.
    pub fn with_error(self, url: &str, error: CacheError) -> Self {
        self.with_responses(url, [Err(error)])
    }

    /// Hands out `responses` for `url` in order, repeating the last one.
    pub fn with_responses(
        self,
        url: &str,
        responses: impl IntoIterator<Item = CacheContents<Bytes>>,
    ) -> Self {
        self.scripts.lock().unwrap().insert(
            url.to_owned(),
            Script {
                responses: responses.into_iter().collect(),
                fetches: 0,
            },
        );
        self
    }

    /// Delays every response.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Holds all fetches in flight until [`release`](Self::release) is called.
    ///
    /// Held fetches are counted as soon as they start.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// The number of fetches of `url` started so far.
    pub fn fetches(&self, url: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .get(url)
            .map_or(0, |script| script.fetches)
    }

    /// The number of fetches started so far, across all urls.
    pub fn total_fetches(&self) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .values()
            .map(|script| script.fetches)
            .sum()
    }

    /// The urls of all fetches in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Waits until `count` fetches of `url` have started.
    pub async fn wait_for_fetches(&self, url: &str, count: usize) {
        wait_until(|| self.fetches(url) >= count).await
    }

    fn next_response(&self, url: &str) -> CacheContents<Bytes> {
        self.started.lock().unwrap().push(url.to_owned());
        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(url) else {
            return Err(CacheError::NotFound);
        };

        script.fetches += 1;
        match script.responses.len() {
            0 => Err(CacheError::NotFound),
            1 => script.responses[0].clone(),
            _ => script.responses.pop_front().unwrap(),
        }
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        progress: &'a ProgressSink,
    ) -> BoxFuture<'a, CacheContents<Bytes>> {
        async move {
            let response = self.next_response(url);

            let mut gate = self.gate.subscribe();
            gate.wait_for(|open| *open).await.ok();

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Ok(blob) = &response {
                let total = Some(blob.len() as u64);
                progress.report(blob.len() as u64 / 2, total);
                progress.report(blob.len() as u64, total);
            }
            response
        }
        .boxed()
    }
}

/// Decodes blobs into UTF-8 strings.
///
/// Blobs starting with `malformed` fail to decode.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestDecoder;

impl Decoder for TestDecoder {
    type Object = String;

    fn decode(&self, blob: Bytes) -> CacheContents<String> {
        if blob.starts_with(b"malformed") {
            return Err(CacheError::Malformed("test blob is malformed".into()));
        }
        String::from_utf8(blob.to_vec()).map_err(|err| CacheError::Malformed(err.to_string()))
    }

    fn weight(&self, object: &String) -> u64 {
        object.len() as u64
    }
}

/// A [`NetworkMonitor`] that reports whatever it was told.
#[derive(Debug)]
pub struct FixedNetwork {
    metered: AtomicBool,
}

impl FixedNetwork {
    pub fn new(connection: Connection) -> Self {
        let network = Self {
            metered: AtomicBool::new(false),
        };
        network.set(connection);
        network
    }

    pub fn unmetered() -> Self {
        Self::new(Connection::Unmetered)
    }

    pub fn metered() -> Self {
        Self::new(Connection::Metered)
    }

    pub fn set(&self, connection: Connection) {
        self.metered
            .store(connection == Connection::Metered, Ordering::Relaxed);
    }
}

impl NetworkMonitor for FixedNetwork {
    fn connection(&self) -> Connection {
        match self.metered.load(Ordering::Relaxed) {
            true => Connection::Metered,
            false => Connection::Unmetered,
        }
    }
}

/// A [`MemoryProbe`] that reports whatever it was told.
#[derive(Debug)]
pub struct FixedProbe(Mutex<f64>);

impl FixedProbe {
    pub fn new(utilization: f64) -> Self {
        Self(Mutex::new(utilization))
    }

    pub fn set(&self, utilization: f64) {
        *self.0.lock().unwrap() = utilization;
    }
}

impl MemoryProbe for FixedProbe {
    fn utilization(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    assets: HashMap<String, Bytes>,
    hits: Mutex<BTreeMap<String, usize>>,
}

impl ServerState {
    fn hit(&self, path: String) {
        *self.hits.lock().unwrap().entry(path).or_default() += 1;
    }

    fn asset(&self, path: &str) -> Response {
        match self.assets.get(path) {
            Some(blob) => blob.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

async fn asset(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    state.hit(format!("/assets/{path}"));
    state.asset(&path)
}

async fn status(State(state): State<Arc<ServerState>>, Path(code): Path<u16>) -> StatusCode {
    state.hit(format!("/status/{code}"));
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn delay(
    State(state): State<Arc<ServerState>>,
    Path((millis, path)): Path<(u64, String)>,
) -> Response {
    state.hit(format!("/delay/{millis}/{path}"));
    tokio::time::sleep(Duration::from_millis(millis)).await;
    state.asset(&path)
}

/// A test server that binds to a random port and serves assets.
///
/// Routes:
///
///  - `/assets/<path>`: The asset registered under `<path>`, or a `404`.
///  - `/status/<code>`: An empty response with the given status code.
///  - `/delay/<millis>/<path>`: The asset registered under `<path>`, after a delay.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new<'a>(assets: impl IntoIterator<Item = (&'a str, Bytes)>) -> Self {
        let state = Arc::new(ServerState {
            assets: assets
                .into_iter()
                .map(|(path, blob)| (path.to_owned(), blob))
                .collect(),
            hits: Default::default(),
        });

        let router = Router::new()
            .route("/assets/*path", get(asset))
            .route("/status/:code", get(status))
            .route("/delay/:millis/*path", get(delay))
            .with_state(Arc::clone(&state));

        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
    }

    /// The number of requests to `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
