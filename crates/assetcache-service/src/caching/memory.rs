use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::types::Priority;

use super::lru::LruList;
use super::CacheKey;

/// A signal from the host that memory is getting scarce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Pressure is gone, normal operation resumes.
    Normal,
    /// Trim to 80% of the current usage.
    Moderate,
    /// Trim to 60% of the current usage and only admit important entries.
    Low,
    /// Drop everything below [`Priority::High`] and only admit important entries.
    Critical,
}

impl MemoryPressure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Critical => "critical",
        }
    }
}

/// A snapshot of the [`MemoryTier`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, or `0.0` before the first access.
    pub hit_rate: f64,
    pub low_memory: bool,
}

#[derive(Debug)]
struct MemoryEntry<T> {
    object: Arc<T>,
    size: u64,
}

#[derive(Debug)]
struct Inner<T> {
    entries: LruList<CacheKey, MemoryEntry<T>>,
    total_bytes: u64,
    /// Bytes held per priority class.
    class_bytes: [u64; Priority::ALL.len()],
    hits: u64,
    misses: u64,
    evictions: u64,
    low_memory: bool,
}

impl<T> Inner<T> {
    fn remove(&mut self, key: &CacheKey) -> Option<MemoryEntry<T>> {
        let class = self.entries.class_of(key)?;
        let entry = self.entries.remove(key)?;
        self.release(class, entry.size);
        Some(entry)
    }

    fn release(&mut self, class: usize, size: u64) {
        self.total_bytes -= size;
        self.class_bytes[class] -= size;
    }

    /// Bytes that entries up to `max_class` could free.
    fn evictable_bytes(&self, max_class: Priority) -> u64 {
        self.class_bytes[..=max_class.index()].iter().sum()
    }

    /// Evicts the least recently used entry of the lowest non-empty class up to `max_class`.
    fn evict_one(&mut self, max_class: Priority) -> bool {
        let class = Priority::ALL
            .iter()
            .take_while(|p| **p <= max_class)
            .find(|p| self.entries.class_len(p.index()) > 0);

        let Some(class) = class else {
            return false;
        };
        let Some((key, entry)) = self.entries.pop_lru(class.index()) else {
            return false;
        };

        self.release(class.index(), entry.size);
        self.evictions += 1;
        metric!(counter("caches.memory.evict") += 1, "priority" => class.as_str());
        tracing::trace!("Evicted `{}` ({} bytes) from memory", key, entry.size);
        true
    }

    fn evict_until(&mut self, target_bytes: u64, max_class: Priority) {
        while self.total_bytes > target_bytes && self.evict_one(max_class) {}
    }
}

/// A bounded, priority-weighted in-memory LRU of decoded objects.
///
/// Objects are kept as [`Arc`]s, and their weight is supplied by the caller. The sum of all
/// weights never exceeds the configured budget: an entry that can only fit by evicting more
/// important entries is not admitted.
#[derive(Debug)]
pub struct MemoryTier<T> {
    budget: u64,
    inner: Mutex<Inner<T>>,
}

impl<T> MemoryTier<T> {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            inner: Mutex::new(Inner {
                entries: LruList::new(Priority::ALL.len()),
                total_bytes: 0,
                class_bytes: [0; Priority::ALL.len()],
                hits: 0,
                misses: 0,
                evictions: 0,
                low_memory: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Looks up an object, refreshing its recency.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        let mut inner = self.lock();
        let object = inner.entries.get(key).map(|entry| Arc::clone(&entry.object));
        match object {
            Some(object) => {
                inner.hits += 1;
                metric!(counter("caches.memory.hit") += 1);
                Some(object)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Inserts an object with the given weight and priority.
    ///
    /// Makes room by evicting entries of the lowest priority class first, and the least recently
    /// used entries within a class, but never an entry more important than the incoming one.
    /// Returns `false` if the object was not admitted.
    pub fn put(&self, key: CacheKey, object: Arc<T>, size: u64, priority: Priority) -> bool {
        let mut inner = self.lock();

        // a replaced value is stale regardless of whether the new one is admitted
        inner.remove(&key);

        if inner.low_memory && priority < Priority::High {
            tracing::debug!("Skipping `{}` at {} priority in low-memory mode", key, priority);
            return false;
        }
        if size > self.budget {
            tracing::debug!(
                "Object `{}` of {} bytes exceeds the memory budget of {} bytes",
                key,
                size,
                self.budget
            );
            return false;
        }

        // nothing is evicted unless the evictions make room
        let target_bytes = self.budget - size;
        let pinned_bytes = inner.total_bytes - inner.evictable_bytes(priority);
        if pinned_bytes > target_bytes {
            tracing::debug!("Not enough evictable memory for `{}` at {} priority", key, priority);
            return false;
        }
        inner.evict_until(target_bytes, priority);

        inner.total_bytes += size;
        inner.class_bytes[priority.index()] += size;
        inner
            .entries
            .insert(key, MemoryEntry { object, size }, priority.index());
        metric!(gauge("caches.memory.bytes") = inner.total_bytes);
        true
    }

    /// Moves an entry into another priority class.
    ///
    /// The entry becomes the most recently used one of its new class.
    pub fn update_priority(&self, key: &CacheKey, priority: Priority) -> bool {
        let mut inner = self.lock();
        let (Some(class), Some(size)) = (
            inner.entries.class_of(key),
            inner.entries.peek(key).map(|entry| entry.size),
        ) else {
            return false;
        };

        inner.entries.set_class(key, priority.index());
        inner.class_bytes[class] -= size;
        inner.class_bytes[priority.index()] += size;
        true
    }

    pub fn priority_of(&self, key: &CacheKey) -> Option<Priority> {
        let class = self.lock().entries.class_of(key)?;
        Priority::ALL.get(class).copied()
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.lock().remove(key).map(|entry| entry.object)
    }

    /// Whether the key is cached, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.class_bytes = [0; Priority::ALL.len()];
    }

    /// The fraction of the budget currently in use, from `0.0` to `1.0`.
    pub fn utilization(&self) -> f64 {
        if self.budget == 0 {
            return 1.0;
        }
        self.lock().total_bytes as f64 / self.budget as f64
    }

    /// Responds to memory pressure signalled by the host.
    pub fn trim(&self, pressure: MemoryPressure) {
        let mut inner = self.lock();
        let before = inner.total_bytes;

        match pressure {
            MemoryPressure::Normal => inner.low_memory = false,
            MemoryPressure::Moderate => {
                inner.evict_until(before / 10 * 8, Priority::Critical);
            }
            MemoryPressure::Low => {
                inner.evict_until(before / 10 * 6, Priority::Critical);
                inner.low_memory = true;
            }
            MemoryPressure::Critical => {
                for class in [Priority::Low, Priority::Normal] {
                    while let Some((_, entry)) = inner.entries.pop_lru(class.index()) {
                        inner.release(class.index(), entry.size);
                        inner.evictions += 1;
                    }
                }
                inner.low_memory = true;
            }
        }

        metric!(counter("caches.memory.trim") += 1, "pressure" => pressure.as_str());
        metric!(gauge("caches.memory.bytes") = inner.total_bytes);
        tracing::debug!(
            "Trimmed memory tier for {:?} pressure from {} to {} bytes",
            pressure,
            before,
            inner.total_bytes
        );
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.lock();
        let accesses = inner.hits + inner.misses;
        MemoryStats {
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            budget_bytes: self.budget,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if accesses == 0 {
                0.0
            } else {
                inner.hits as f64 / accesses as f64
            },
            low_memory: inner.low_memory,
        }
    }
}
