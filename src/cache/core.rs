use super::clock::{Clock, SystemClock};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// One cached value and its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Stored value; `Value::Null` and `false` are present values, not misses
    pub value: Value,
    /// `None` means the entry lives as long as the worker
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Counters for cache behaviour.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped because their TTL elapsed (lazily or by sweep)
    pub fn get_expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Entries dropped by the LRU bound
    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Worker-lifetime key/value store with per-entry expiry.
///
/// All operations take the same lock, so `put`/`get`/`forget` on one key are
/// atomic with respect to each other even when several coroutines share the cache.
pub struct ScopedCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    tainted: AtomicBool,
    stats: CacheStats,
}

impl std::fmt::Debug for ScopedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedCache")
            .field("len", &self.len())
            .field("tainted", &self.is_tainted())
            .finish()
    }
}

impl Default for ScopedCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScopedCache {
    /// Cache bounded to `max_entries` (0 = unbounded) using the wall clock.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        let entries = match NonZeroUsize::new(max_entries) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            clock,
            tainted: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            if !self.tainted.swap(true, Ordering::SeqCst) {
                error!("Scoped cache lock poisoned - cache contents no longer trusted");
            }
            poisoned.into_inner()
        })
    }

    /// Store `value` under `key`. `ttl = None` keeps it for the worker's lifetime;
    /// a zero TTL stores nothing and drops any previous value.
    pub fn put(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let key = key.into();
        let now = self.clock.now();
        let mut entries = self.lock();

        if ttl.is_some_and(|t| t.is_zero()) {
            entries.pop(&key);
            return;
        }

        // TTLs too large to represent never expire
        let expires_at = ttl.and_then(|t| now.checked_add(t));
        if let Some((old_key, _)) = entries.push(key.clone(), CacheEntry { value, expires_at }) {
            if old_key != key {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %old_key, "Scoped cache evicted least recently used entry");
            }
        }
    }

    /// Live value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.lock();

        let expired = match entries.peek(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            entries.pop(key);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Whether a live value exists, without touching LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Remove `key`. Returns whether a live value was removed.
    pub fn forget(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .pop(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            self.stats
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(purged = expired.len(), "Scoped cache sweep");
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set once a lock holder panicked; the worker must be recycled.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
