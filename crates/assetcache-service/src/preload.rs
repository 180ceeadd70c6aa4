//! Speculative background loading.
//!
//! A [`Preloader`] warms the cache with assets the user is likely to request next. Requests
//! pass an admission gate, wait for a quiescence window so they do not compete with foreground
//! loads, and are then handed to the [`PriorityLoader`] at a reduced priority.
//!
//! ### Metrics
//!
//! - `preload.scheduled`: Admitted preloads.
//! - `preload.rejected`: Rejected preloads, tagged by `reason`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, Decoder, MemoryTier};
use crate::config::PreloadConfig;
use crate::loader::PriorityLoader;
use crate::types::Priority;
use crate::utils::futures::CallOnDrop;

/// The maximum number of neighbors predicted by [`predict_neighbors`].
const MAX_NEIGHBORS: usize = 6;

/// Reports how much of the available memory is in use.
pub trait MemoryProbe: Send + Sync + 'static {
    /// The utilization, between `0.0` and `1.0`.
    fn utilization(&self) -> f64;
}

impl<T: Send + Sync + 'static> MemoryProbe for MemoryTier<T> {
    fn utilization(&self) -> f64 {
        MemoryTier::utilization(self)
    }
}

/// The reason a preload was not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PreloadRejection {
    #[error("preloading is disabled")]
    Disabled,
    #[error("a preload for this key is already scheduled")]
    AlreadyScheduled,
    #[error("too many active preload sessions")]
    TooManySessions,
    #[error("memory utilization is above the high-water mark")]
    MemoryPressure,
}

impl PreloadRejection {
    fn metrics_tag(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::AlreadyScheduled => "duplicate",
            Self::TooManySessions => "sessions",
            Self::MemoryPressure => "memory",
        }
    }
}

/// A snapshot of an admitted preload.
#[derive(Clone, Debug)]
pub struct PreloadSession {
    pub key: CacheKey,
    pub priority: Priority,
    pub started_at: Instant,
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PreloadStats {
    pub enabled: bool,
    pub active_sessions: u64,
    pub scheduled: u64,
    pub rejected: u64,
    pub completed: u64,
    pub cancelled: u64,
}

struct Session {
    id: u64,
    priority: Priority,
    started_at: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

struct Inner<D: Decoder> {
    config: PreloadConfig,
    loader: PriorityLoader<D>,
    probe: Arc<dyn MemoryProbe>,
    runtime: tokio::runtime::Handle,
    enabled: AtomicBool,
    sessions: Mutex<HashMap<CacheKey, Session>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl<D: Decoder> Inner<D> {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the session of `key`, unless it was replaced in the meantime.
    fn finish(&self, key: &CacheKey, id: u64) {
        let mut sessions = self.lock();
        if sessions.get(key).is_some_and(|session| session.id == id) {
            sessions.remove(key);
        }
    }
}

/// Schedules speculative loads under concurrency and memory constraints.
pub struct Preloader<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for Preloader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder> std::fmt::Debug for Preloader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloader")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Decoder> Preloader<D> {
    pub fn new(
        config: PreloadConfig,
        loader: PriorityLoader<D>,
        probe: Arc<dyn MemoryProbe>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                loader,
                probe,
                runtime,
                enabled: AtomicBool::new(config.enabled),
                sessions: Default::default(),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Schedules a speculative load of `key`.
    ///
    /// Once admitted, the load waits for the quiescence window and is then submitted to the
    /// loader at no more than [`Priority::Normal`].
    pub fn schedule(
        &self,
        key: CacheKey,
        url: &str,
        priority: Priority,
    ) -> Result<(), PreloadRejection> {
        let inner = &self.inner;
        let mut sessions = inner.lock();

        let rejection = if !inner.enabled.load(Ordering::Relaxed) {
            Some(PreloadRejection::Disabled)
        } else if sessions.contains_key(&key) {
            Some(PreloadRejection::AlreadyScheduled)
        } else if sessions.len() >= inner.config.max_sessions {
            Some(PreloadRejection::TooManySessions)
        } else if inner.probe.utilization() * 100.0 > f64::from(inner.config.high_water_mark_percent)
        {
            Some(PreloadRejection::MemoryPressure)
        } else {
            None
        };

        if let Some(rejection) = rejection {
            drop(sessions);
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            metric!(counter("preload.rejected") += 1, "reason" => rejection.metrics_tag());
            tracing::debug!("Rejected preload of `{}`: {}", key, rejection);
            return Err(rejection);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        sessions.insert(
            key.clone(),
            Session {
                id,
                priority,
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        drop(sessions);

        inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        metric!(counter("preload.scheduled") += 1);
        tracing::debug!("Scheduled preload of `{}`", key);

        let url = url.to_owned();
        let task = Arc::clone(inner).run(key, url, priority.min(Priority::Normal), id, cancel);
        inner.runtime.spawn(task);

        Ok(())
    }

    /// Cancels the preload of `key`. Returns `false` if there was none.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let Some(session) = self.inner.lock().remove(key) else {
            return false;
        };

        session.cancel.cancel();
        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Cancelled preload of `{}`", key);
        true
    }

    /// Cancels all preloads, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let sessions: Vec<_> = self.inner.lock().drain().collect();
        for (_, session) in &sessions {
            session.cancel.cancel();
        }

        let cancelled = sessions.len();
        self.inner
            .counters
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        if cancelled > 0 {
            tracing::debug!("Cancelled {} preloads", cancelled);
        }
        cancelled
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Relaxed);
    }

    /// Disables preloading, cancelling every active preload.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Relaxed);
        self.cancel_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn session(&self, key: &CacheKey) -> Option<PreloadSession> {
        self.inner.lock().get(key).map(|session| PreloadSession {
            key: key.clone(),
            priority: session.priority,
            started_at: session.started_at,
            cancelled: session.cancel.is_cancelled(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.lock().len()
    }

    /// Schedules the likely next items around `current` out of `total`.
    ///
    /// `make_request` maps an index to the key and url to load. The nearest neighbors are
    /// scheduled at [`Priority::Normal`], farther ones at [`Priority::Low`]. At most `max`
    /// neighbors are considered. Returns the number of admitted preloads.
    pub fn schedule_neighbors<F>(
        &self,
        current: usize,
        total: usize,
        max: usize,
        mut make_request: F,
    ) -> usize
    where
        F: FnMut(usize) -> Option<(CacheKey, String)>,
    {
        let mut admitted = 0;
        for index in predict_neighbors(current, total).into_iter().take(max) {
            let Some((key, url)) = make_request(index) else {
                continue;
            };
            let priority = match index.abs_diff(current) {
                1 => Priority::Normal,
                _ => Priority::Low,
            };
            if self.schedule(key, &url, priority).is_ok() {
                admitted += 1;
            }
        }
        admitted
    }

    pub fn stats(&self) -> PreloadStats {
        let counters = &self.inner.counters;
        PreloadStats {
            enabled: self.is_enabled(),
            active_sessions: self.active_sessions() as u64,
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl<D: Decoder> Inner<D> {
    async fn run(
        self: Arc<Self>,
        key: CacheKey,
        url: String,
        priority: Priority,
        id: u64,
        cancel: CancellationToken,
    ) {
        let _finish = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            CallOnDrop::new(move || inner.finish(&key, id))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.quiescence) => {}
        }

        let load = self.loader.load(key.clone(), &url, priority);
        // dropping `load` on cancellation gives up interest in the fetch
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = load => result,
        };

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(loaded) => tracing::debug!(
                "Preloaded `{}` from {}",
                key,
                loaded.origin.as_str()
            ),
            Err(err) => tracing::debug!(
                error = &err as &dyn std::error::Error,
                "Preload of `{}` failed",
                key
            ),
        }
    }
}

/// Predicts the indices that are likely to be requested after `current`.
///
/// Neighbors are ordered by distance, the following one first: `current + 1`, `current - 1`,
/// `current + 2`, `current - 2`, and so on. Only indices within `0..total` are returned.
pub fn predict_neighbors(current: usize, total: usize) -> Vec<usize> {
    let mut neighbors = Vec::with_capacity(MAX_NEIGHBORS);
    for distance in 1..=MAX_NEIGHBORS / 2 {
        if let Some(next) = current.checked_add(distance).filter(|next| *next < total) {
            neighbors.push(next);
        }
        if let Some(previous) = current.checked_sub(distance).filter(|previous| *previous < total) {
            neighbors.push(previous);
        }
    }
    neighbors
}
