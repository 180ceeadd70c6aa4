use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError, CacheKey};
use crate::types::Priority;

/// The externally visible state of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing is known about the key.
    Idle,
    /// A fetch is queued or running. Progress is reported in percent, once known.
    Loading { progress: Option<u8> },
    /// The object was loaded and is still cached.
    ///
    /// The state machine forgets successful loads right away. This state is derived from the
    /// memory tier by [`PriorityLoader::load_state`](super::PriorityLoader::load_state).
    Success,
    /// The last load failed recently.
    Error(CacheError),
}

/// A unit of work for the worker pool.
///
/// Jobs are cheap to duplicate: a job that no longer matches the current cycle of its key, or
/// whose cycle was already claimed, is stale and skipped by [`LoadStateMachine::claim`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub key: CacheKey,
    pub cycle: u64,
    pub priority: Priority,
}

/// Proof that a worker owns the fetch of one loading cycle.
#[derive(Clone, Debug)]
pub struct Ticket {
    key: CacheKey,
    cycle: u64,
    cancel: CancellationToken,
}

impl Ticket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Resolves once every listener of this cycle is gone, or on shutdown.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A successfully claimed job.
#[derive(Debug)]
pub struct Claim {
    pub ticket: Ticket,
    pub url: Arc<str>,
    pub priority: Priority,
}

/// The result of [`LoadStateMachine::attach`].
#[derive(Debug)]
pub enum Attach<T> {
    /// The key was idle and a new loading cycle started. `job` needs to be queued.
    Started { handle: LoadHandle<T>, job: Job },
    /// The key was already loading and the listener joined the in-flight fetch.
    ///
    /// If the listener raised the priority of a fetch that is still queued, `escalated` holds a
    /// job at the new priority that needs to be queued.
    Joined {
        handle: LoadHandle<T>,
        escalated: Option<Job>,
    },
    /// The last load of the key failed recently, or the state machine was shut down.
    Failed(CacheError),
}

type Listener<T> = (u64, oneshot::Sender<CacheContents<T>>);

struct Flight<T> {
    cycle: u64,
    claimed: bool,
    priority: Priority,
    url: Arc<str>,
    progress: Option<u8>,
    listeners: Vec<Listener<T>>,
    cancel: CancellationToken,
}

enum Record<T> {
    Loading(Flight<T>),
    Error { error: CacheError, expires: Instant },
}

impl<T> Record<T> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Record::Error { expires, .. } if *expires <= now)
    }
}

struct Inner<T> {
    records: HashMap<CacheKey, Record<T>>,
    next_cycle: u64,
    next_listener: u64,
}

impl<T> Inner<T> {
    /// Drops every error record that outlived its lifetime.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.records.retain(|_, record| !record.is_expired(now));
    }

    /// Returns `key` to idle if its error record expired.
    fn expire(&mut self, key: &CacheKey) {
        if self
            .records
            .get(key)
            .is_some_and(|record| record.is_expired(Instant::now()))
        {
            self.records.remove(key);
        }
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    root: CancellationToken,
    error_ttl: Duration,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a listener that lost interest.
    ///
    /// When the last listener of a loading cycle leaves, the cycle is cancelled and the key
    /// returns to idle.
    fn detach(&self, key: &CacheKey, cycle: u64, listener: u64) {
        let mut inner = self.lock();
        let Some(Record::Loading(flight)) = inner.records.get_mut(key) else {
            return;
        };
        if flight.cycle != cycle {
            return;
        }

        flight.listeners.retain(|(id, _)| *id != listener);
        if flight.listeners.is_empty() {
            flight.cancel.cancel();
            inner.records.remove(key);
            tracing::debug!("Cancelled load of `{}` without listeners", key);
        }
    }
}

/// Tracks the lifecycle of every key: idle, loading or error.
///
/// All transitions happen under one lock and never block. Listeners are notified exactly once,
/// outside of the lock. Clones share the same state.
///
/// Only loading keys and recent failures are tracked. A successful load is forgotten once its
/// listeners are notified, and a failure is forgotten after the configured error lifetime, so
/// the next load of that key fetches again.
pub struct LoadStateMachine<T> {
    shared: Arc<Shared<T>>,
}

impl<T> std::fmt::Debug for LoadStateMachine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadStateMachine")
            .field("records", &self.shared.lock().records.len())
            .finish()
    }
}

impl<T> Clone for LoadStateMachine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> LoadStateMachine<T> {
    /// Creates a state machine that remembers failures for `error_ttl`.
    pub fn new(error_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    records: HashMap::new(),
                    next_cycle: 0,
                    next_listener: 0,
                }),
                root: CancellationToken::new(),
                error_ttl,
            }),
        }
    }

    /// Registers interest in `key`.
    ///
    /// Starts a new loading cycle if the key is idle, joins the in-flight fetch if it is loading,
    /// and reports a recent failure right away. After [`cancel_all`](Self::cancel_all), every
    /// attach fails with [`CacheError::Cancelled`].
    pub fn attach(&self, key: CacheKey, url: &str, priority: Priority) -> Attach<T> {
        let mut guard = self.shared.lock();
        // checked under the lock, so no cycle starts after `cancel_all` drained the records
        if self.shared.root.is_cancelled() {
            return Attach::Failed(CacheError::Cancelled);
        }

        let inner = &mut *guard;
        inner.expire(&key);
        let listener = inner.next_listener;

        match inner.records.get_mut(&key) {
            Some(Record::Loading(flight)) => {
                inner.next_listener += 1;
                let (sender, receiver) = oneshot::channel();
                flight.listeners.push((listener, sender));

                let escalated = if priority > flight.priority {
                    flight.priority = priority;
                    (!flight.claimed).then(|| Job {
                        key: key.clone(),
                        cycle: flight.cycle,
                        priority,
                    })
                } else {
                    None
                };

                let handle = self.pending_handle(receiver, key, flight.cycle, listener);
                Attach::Joined { handle, escalated }
            }
            Some(Record::Error { error, .. }) => Attach::Failed(error.clone()),
            None => {
                inner.next_listener += 1;
                let cycle = inner.next_cycle;
                inner.next_cycle += 1;

                let (sender, receiver) = oneshot::channel();
                inner.records.insert(
                    key.clone(),
                    Record::Loading(Flight {
                        cycle,
                        claimed: false,
                        priority,
                        url: url.into(),
                        progress: None,
                        listeners: vec![(listener, sender)],
                        cancel: self.shared.root.child_token(),
                    }),
                );
                tracing::debug!("Started loading `{}` at {} priority", key, priority);

                let job = Job {
                    key: key.clone(),
                    cycle,
                    priority,
                };
                let handle = self.pending_handle(receiver, key, cycle, listener);
                Attach::Started { handle, job }
            }
        }
    }

    fn pending_handle(
        &self,
        receiver: oneshot::Receiver<CacheContents<T>>,
        key: CacheKey,
        cycle: u64,
        listener: u64,
    ) -> LoadHandle<T> {
        LoadHandle {
            state: HandleState::Pending {
                receiver,
                detach: Some(Detach {
                    shared: Arc::clone(&self.shared) as Arc<dyn Detachable>,
                    key,
                    cycle,
                    listener,
                }),
            },
        }
    }

    /// Claims a queued job for execution.
    ///
    /// Returns `None` for stale jobs: the cycle was cancelled, superseded, or already claimed
    /// through a job at another priority.
    pub fn claim(&self, job: &Job) -> Option<Claim> {
        let mut inner = self.shared.lock();
        let Some(Record::Loading(flight)) = inner.records.get_mut(&job.key) else {
            return None;
        };
        if flight.cycle != job.cycle || flight.claimed {
            return None;
        }

        flight.claimed = true;
        Some(Claim {
            ticket: Ticket {
                key: job.key.clone(),
                cycle: flight.cycle,
                cancel: flight.cancel.clone(),
            },
            url: Arc::clone(&flight.url),
            priority: flight.priority,
        })
    }

    /// Updates the progress of a loading key. Values are capped at `100`.
    pub fn set_progress(&self, key: &CacheKey, progress: u8) {
        let mut inner = self.shared.lock();
        if let Some(Record::Loading(flight)) = inner.records.get_mut(key) {
            flight.progress = Some(progress.min(100));
        }
    }

    /// Returns a key to idle, discarding a recent failure.
    ///
    /// This is a no-op for idle and loading keys. Returns whether a failure was discarded.
    pub fn reset(&self, key: &CacheKey) -> bool {
        let mut inner = self.shared.lock();
        inner.expire(key);
        match inner.records.get(key) {
            Some(Record::Error { .. }) => {
                inner.records.remove(key);
                tracing::debug!("Reset `{}` to idle", key);
                true
            }
            Some(Record::Loading(_)) | None => false,
        }
    }

    /// The state of `key` as far as the state machine knows. Never [`LoadState::Success`].
    pub fn state(&self, key: &CacheKey) -> LoadState {
        let mut inner = self.shared.lock();
        inner.expire(key);
        match inner.records.get(key) {
            None => LoadState::Idle,
            Some(Record::Loading(flight)) => LoadState::Loading {
                progress: flight.progress,
            },
            Some(Record::Error { error, .. }) => LoadState::Error(error.clone()),
        }
    }

    /// The number of keys that are loading or failed recently.
    pub fn record_count(&self) -> usize {
        let mut inner = self.shared.lock();
        inner.purge_expired();
        inner.records.len()
    }

    /// The number of listeners waiting for `key`.
    pub fn listener_count(&self, key: &CacheKey) -> usize {
        match self.shared.lock().records.get(key) {
            Some(Record::Loading(flight)) => flight.listeners.len(),
            _ => 0,
        }
    }

    /// The number of keys currently loading.
    pub fn in_flight(&self) -> usize {
        self.shared
            .lock()
            .records
            .values()
            .filter(|record| matches!(record, Record::Loading(_)))
            .count()
    }

    /// Cancels every loading cycle, now and in the future, notifying all listeners with
    /// [`CacheError::Cancelled`].
    pub fn cancel_all(&self) {
        self.shared.root.cancel();

        let mut listeners = Vec::new();
        {
            let mut inner = self.shared.lock();
            inner.records.retain(|_, record| match record {
                Record::Loading(flight) => {
                    listeners.append(&mut flight.listeners);
                    false
                }
                _ => true,
            });
        }

        for (_, sender) in listeners {
            sender.send(Err(CacheError::Cancelled)).ok();
        }
    }
}

impl<T: Clone> LoadStateMachine<T> {
    /// Completes the loading cycle of `ticket`, notifying every listener with `outcome`.
    ///
    /// Returns the number of notified listeners. Outcomes of cancelled or superseded cycles are
    /// dropped.
    pub fn complete(&self, ticket: &Ticket, outcome: CacheContents<T>) -> usize {
        let listeners = {
            let mut inner = self.shared.lock();
            let Some(Record::Loading(flight)) = inner.records.get_mut(&ticket.key) else {
                return 0;
            };
            if flight.cycle != ticket.cycle {
                return 0;
            }

            let listeners = std::mem::take(&mut flight.listeners);
            match &outcome {
                Ok(_) => {
                    inner.records.remove(&ticket.key);
                }
                Err(error) => {
                    inner.purge_expired();
                    let expires = Instant::now() + self.shared.error_ttl;
                    let record = Record::Error {
                        error: error.clone(),
                        expires,
                    };
                    inner.records.insert(ticket.key.clone(), record);
                }
            }
            listeners
        };

        match &outcome {
            Ok(_) => tracing::debug!("Loaded `{}`", ticket.key),
            Err(err) => tracing::debug!(
                error = err as &dyn std::error::Error,
                "Failed to load `{}`",
                ticket.key
            ),
        }

        let notified = listeners.len();
        for (_, sender) in listeners {
            // the receiving handle may have been dropped in the meantime
            sender.send(outcome.clone()).ok();
        }
        notified
    }
}

/// Type-erased access to [`Shared::detach`] for [`LoadHandle`].
trait Detachable: Send + Sync {
    fn detach(&self, key: &CacheKey, cycle: u64, listener: u64);
}

impl<T: Send> Detachable for Shared<T> {
    fn detach(&self, key: &CacheKey, cycle: u64, listener: u64) {
        Shared::detach(self, key, cycle, listener)
    }
}

struct Detach {
    shared: Arc<dyn Detachable>,
    key: CacheKey,
    cycle: u64,
    listener: u64,
}

enum HandleState<T> {
    Ready(Option<CacheContents<T>>),
    Pending {
        receiver: oneshot::Receiver<CacheContents<T>>,
        detach: Option<Detach>,
    },
}

/// A future resolving to the outcome of a load.
///
/// Dropping an unresolved handle removes its listener. When the last listener of a fetch is
/// dropped, the fetch is cancelled at its next checkpoint.
pub struct LoadHandle<T> {
    state: HandleState<T>,
}

impl<T> LoadHandle<T> {
    /// A handle that resolves right away.
    pub fn ready(outcome: CacheContents<T>) -> Self {
        Self {
            state: HandleState::Ready(Some(outcome)),
        }
    }

    /// Whether this handle waits for an in-flight fetch.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandleState::Pending { .. })
    }
}

impl<T> std::fmt::Debug for LoadHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

// No field is ever pinned structurally.
impl<T> Unpin for LoadHandle<T> {}

impl<T> Future for LoadHandle<T> {
    type Output = CacheContents<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(CacheError::InternalError)))
            }
            HandleState::Pending { receiver, detach } => {
                let outcome = std::task::ready!(Pin::new(receiver).poll(cx));
                // resolved listeners are removed by the sender side
                *detach = None;
                Poll::Ready(outcome.unwrap_or(Err(CacheError::Cancelled)))
            }
        }
    }
}

impl<T> Drop for LoadHandle<T> {
    fn drop(&mut self) {
        if let HandleState::Pending {
            detach: Some(detach),
            ..
        } = &self.state
        {
            detach
                .shared
                .detach(&detach.key, detach.cycle, detach.listener);
        }
    }
}
